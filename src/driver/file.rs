/* File-source reference driver: produces one record per `next()` call, each holding the next
 * chunk of bytes read sequentially from a backing file. Ported from original_source/test/file.c,
 * which drives exactly this on-demand, one-chunk-at-a-time pattern via hound_next + hound_read.
 * Modeled as pull-mode (rather than push-over-a-regular-fd, which poll(2) can't meaningfully
 * block on) so that `next` is what actually triggers production, matching the original test's
 * use of the driver. */
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::SystemTime;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe;

use super::{DataRq, DriverKind, DriverOps, DrvDatadesc, InitArg, PollEvents, PollOutcome};
use crate::error::{HoundError, Result};
use crate::record::{DataId, Record};
use crate::schema::SchemaDesc;

/// Data id for the file source's single data stream.
pub const FILE_ID: DataId = 0x20;

const DEFAULT_CHUNK_SIZE: usize = 1;

/// The schema descriptor the file driver exposes.
pub fn schema_descs() -> Vec<SchemaDesc> {
    vec![SchemaDesc {
        data_id: FILE_ID,
        name: "file".to_string(),
        fmts: Vec::new(),
    }]
}

pub struct FileDriver {
    path: PathBuf,
    chunk_size: usize,
    file: Option<File>,
    read_fd: Option<OwnedFd>,
    write_fd: Option<OwnedFd>,
    pending_chunks: VecDeque<()>,
}

impl Default for FileDriver {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            file: None,
            read_fd: None,
            write_fd: None,
            pending_chunks: VecDeque::new(),
        }
    }
}

impl FileDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(std::io::Error::from)?;
        Ok(())
    }
}

impl DriverOps for FileDriver {
    fn init(&mut self, path: &str, args: &[InitArg]) -> Result<()> {
        self.path = PathBuf::from(path);
        if let Some(InitArg::U32(chunk)) = args.first() {
            if *chunk == 0 {
                return Err(HoundError::InvalidValue("chunk_size must be nonzero".into()));
            }
            self.chunk_size = *chunk as usize;
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }

    fn device_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }

    fn datadesc(&mut self, descs: &mut [DrvDatadesc]) -> Result<()> {
        for desc in descs.iter_mut() {
            if desc.data_id == FILE_ID {
                desc.enabled = true;
                desc.avail_periods = vec![0];
            } else {
                desc.enabled = false;
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
        self.file = Some(File::open(&self.path)?);

        let (read_fd, write_fd) = pipe().map_err(std::io::Error::from)?;
        Self::set_nonblocking(&read_fd)?;
        Self::set_nonblocking(&write_fd)?;
        let raw = read_fd.as_raw_fd();
        self.read_fd = Some(read_fd);
        self.write_fd = Some(write_fd);
        Ok(raw)
    }

    fn next(&mut self, _id: DataId, n: usize) -> Result<()> {
        for _ in 0..n {
            self.pending_chunks.push_back(());
        }
        if let Some(write_fd) = &self.write_fd {
            let _ = nix::unistd::write(write_fd, &[1u8]);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.file = None;
        self.read_fd = None;
        self.write_fd = None;
        self.pending_chunks.clear();
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
        while self.pending_chunks.front().is_some() {
            if records.len() >= super::MAX_RECORDS_PER_CALL {
                break;
            }
            let mut buf = vec![0u8; self.chunk_size];
            let file = match &mut self.file {
                Some(f) => f,
                None => break,
            };
            let n = file.read(&mut buf)?;
            if n == 0 {
                // End of file: drop any remaining requested chunks.
                self.pending_chunks.clear();
                break;
            }
            buf.truncate(n);
            self.pending_chunks.pop_front();
            records.push(Record {
                seqno: 0,
                data_id: FILE_ID,
                dev_id: 0,
                timestamp: SystemTime::now(),
                payload: buf,
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
    use std::io::Write;

    #[test]
    fn reads_file_one_chunk_at_a_time() {
        let mut tmp = tempfile_with_content(b"hello");
        let mut driver = FileDriver::new();
        driver.init(tmp.path_str(), &[]).unwrap();
        driver.start().unwrap();

        driver.next(FILE_ID, 1).unwrap();
        let outcome = driver.poll(PollEvents::default()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].payload, b"h");

        tmp.cleanup();
    }

    #[test]
    fn stops_at_eof() {
        let mut tmp = tempfile_with_content(b"ab");
        let mut driver = FileDriver::new();
        driver.init(tmp.path_str(), &[]).unwrap();
        driver.start().unwrap();

        driver.next(FILE_ID, 5).unwrap();
        let outcome = driver.poll(PollEvents::default()).unwrap();
        assert_eq!(outcome.records.len(), 2);

        tmp.cleanup();
    }

    struct TempFile {
        path: PathBuf,
    }

    impl TempFile {
        fn path_str(&self) -> &str {
            self.path.to_str().unwrap()
        }

        fn cleanup(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn tempfile_with_content(content: &[u8]) -> TempFile {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let mut path = std::env::temp_dir();
        path.push(format!(
            "hound-file-driver-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        TempFile { path }
    }
}
