/* No-op reference driver: implements the full DriverOps contract without talking to real
 * hardware. Ported from original_source/test/driver/nop.c, whose own header describes its
 * purpose exactly: "implements all the required driver functions but does not actually produce
 * data, and is used for unit-testing the driver core." Unlike the C version (push-mode, parse a
 * no-op), this one is pull-mode: `next` queues records and wakes a self-pipe so the I/O loop's
 * `poll` call drains them, which is what lets it actually exercise on-demand delivery end to end. */
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::SystemTime;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe;

use super::{DataRq, DriverKind, DriverOps, DrvDatadesc, InitArg, PollEvents, PollOutcome};
use crate::error::Result;
use crate::record::{DataId, Record};
use crate::schema::SchemaDesc;

/// Data id for the NOP driver's periodic accelerometer-like data.
pub const ACCEL_ID: DataId = 0x10;
/// Data id for the NOP driver's on-demand-only gyroscope-like data.
pub const GYRO_ID: DataId = 0x11;

const NS_PER_SEC: u64 = 1_000_000_000;

/// Available periods for [`ACCEL_ID`]: on-demand plus several periodic rates.
pub fn accel_periods() -> Vec<u64> {
    vec![0, NS_PER_SEC, NS_PER_SEC / 10, NS_PER_SEC / 500, NS_PER_SEC / 1000, NS_PER_SEC / 2000]
}

/// Available periods for [`GYRO_ID`]: on-demand only.
pub fn gyro_periods() -> Vec<u64> {
    vec![0]
}

/// Build the two schema descriptors the NOP driver exposes, for tests and
/// demos that want to call `DriverRegistry::driver_init` without a YAML
/// file on disk.
pub fn schema_descs() -> Vec<SchemaDesc> {
    vec![
        SchemaDesc {
            data_id: ACCEL_ID,
            name: "super-extra-accelerometer".to_string(),
            fmts: Vec::new(),
        },
        SchemaDesc {
            data_id: GYRO_ID,
            name: "oneshot-gyroscope".to_string(),
            fmts: Vec::new(),
        },
    ]
}

pub struct NopDriver {
    read_fd: Option<OwnedFd>,
    write_fd: Option<OwnedFd>,
    pending: VecDeque<DataId>,
}

impl Default for NopDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NopDriver {
    pub fn new() -> Self {
        Self {
            read_fd: None,
            write_fd: None,
            pending: VecDeque::new(),
        }
    }

    fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(std::io::Error::from)?;
        Ok(())
    }
}

impl DriverOps for NopDriver {
    fn init(&mut self, _path: &str, _args: &[InitArg]) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }

    fn device_name(&self) -> Option<String> {
        Some("dummy".to_string())
    }

    fn datadesc(&mut self, descs: &mut [DrvDatadesc]) -> Result<()> {
        for desc in descs.iter_mut() {
            match desc.data_id {
                ACCEL_ID => {
                    desc.enabled = true;
                    desc.avail_periods = accel_periods();
                }
                GYRO_ID => {
                    desc.enabled = true;
                    desc.avail_periods = gyro_periods();
                }
                _ => desc.enabled = false,
            }
        }
        Ok(())
    }

    fn setdata(&mut self, _rqs: &[DataRq]) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Pull
    }

    fn start(&mut self) -> Result<RawFd> {
        let (read_fd, write_fd) = pipe().map_err(std::io::Error::from)?;
        Self::set_nonblocking(&read_fd)?;
        Self::set_nonblocking(&write_fd)?;
        let raw = read_fd.as_raw_fd();
        self.read_fd = Some(read_fd);
        self.write_fd = Some(write_fd);
        Ok(raw)
    }

    fn next(&mut self, id: DataId, n: usize) -> Result<()> {
        for _ in 0..n {
            self.pending.push_back(id);
        }
        if let Some(write_fd) = &self.write_fd {
            let _ = nix::unistd::write(write_fd, &[1u8]);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.read_fd = None;
        self.write_fd = None;
        self.pending.clear();
        Ok(())
    }

    fn poll(&mut self, _events: PollEvents) -> Result<PollOutcome> {
        if let Some(read_fd) = &self.read_fd {
            let mut buf = [0u8; 64];
            loop {
                match nix::unistd::read(read_fd.as_raw_fd(), &mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(Errno::EAGAIN) => break,
                    Err(_) => break,
                }
            }
        }

        let mut records = Vec::new();
        while let Some(data_id) = self.pending.pop_front() {
            if records.len() >= super::MAX_RECORDS_PER_CALL {
                break;
            }
            records.push(Record {
                seqno: 0,
                data_id,
                dev_id: 0,
                timestamp: SystemTime::now(),
                payload: vec![0u8; 4],
            });
        }

        Ok(PollOutcome {
            records,
            next_events: PollEvents {
                readable: true,
                writable: false,
            },
            timeout: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datadesc_enables_known_ids_only() {
        let mut driver = NopDriver::new();
        let mut descs = vec![
            DrvDatadesc::disabled(ACCEL_ID),
            DrvDatadesc::disabled(GYRO_ID),
            DrvDatadesc::disabled(0xBAD),
        ];
        driver.datadesc(&mut descs).unwrap();
        assert!(descs[0].enabled);
        assert_eq!(descs[0].avail_periods, accel_periods());
        assert!(descs[1].enabled);
        assert_eq!(descs[1].avail_periods, gyro_periods());
        assert!(!descs[2].enabled);
    }

    #[test]
    fn next_then_poll_produces_records() {
        let mut driver = NopDriver::new();
        driver.start().unwrap();
        driver.next(ACCEL_ID, 3).unwrap();
        let outcome = driver.poll(PollEvents::default()).unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert!(outcome.records.iter().all(|r| r.data_id == ACCEL_ID));
    }

    #[test]
    fn poll_with_nothing_pending_is_empty() {
        let mut driver = NopDriver::new();
        driver.start().unwrap();
        let outcome = driver.poll(PollEvents::default()).unwrap();
        assert!(outcome.records.is_empty());
    }
}
