//! Multi-process reduction and trace file I/O

use super::TracePacket;
use crate::error::{Result, RuntimeError};
use std::io::Cursor;
use std::path::Path;

/// Exchange of per-rank trace buffers in a distributed run
pub trait RankExchange: Send + Sync {
    /// Rank of this process (0 is the root)
    fn rank(&self) -> usize;

    /// Number of ranks
    fn size(&self) -> usize;

    /// Gather every rank's buffer on the root
    ///
    /// The root receives one buffer per rank, in rank order; other ranks
    /// receive an empty list.
    fn gather(&self, local: Vec<u8>) -> Result<Vec<Vec<u8>>>;
}

/// Exchange for a run with a single process
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl RankExchange for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather(&self, local: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![local])
    }
}

/// Concatenate per-rank buffers into one owned buffer
pub fn combine_multi_process(buffers: Vec<Vec<u8>>) -> Vec<u8> {
    let total = buffers.iter().map(Vec::len).sum();
    let mut combined = Vec::with_capacity(total);
    for buffer in buffers {
        combined.extend_from_slice(&buffer);
    }
    combined
}

/// Persist trace bytes, creating the parent directory
pub fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    let output_error = |source| RuntimeError::TraceOutput {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(output_error)?;
    }
    std::fs::write(path, bytes).map_err(output_error)
}

/// Decode a (possibly concatenated) trace buffer
pub fn decode_trace(bytes: &[u8]) -> Result<Vec<TracePacket>> {
    let mut cursor = Cursor::new(bytes);
    let mut packets = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let packet: TracePacket = rmp_serde::from_read(&mut cursor)?;
        packets.push(packet);
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::Category;
    use crate::trace_session::TrackEvent;
    use tempfile::TempDir;

    fn packet(pid: u32, name: &str) -> Vec<u8> {
        TracePacket {
            pid,
            event: TrackEvent::SliceBegin {
                ts: 1,
                thread: 0,
                os_tid: 1,
                category: Category::Host,
                name: name.to_string(),
            },
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_single_process_gather() {
        let exchange = SingleProcess;
        assert_eq!(exchange.rank(), 0);
        assert_eq!(exchange.size(), 1);
        assert_eq!(exchange.gather(vec![1, 2]).unwrap(), vec![vec![1, 2]]);
    }

    #[test]
    fn test_combined_buffers_decode_in_rank_order() {
        let combined = combine_multi_process(vec![packet(10, "a"), packet(11, "b")]);
        let packets = decode_trace(&combined).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].pid, 10);
        assert_eq!(packets[1].pid, 11);
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode_trace(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(decode_trace(&[0xc1, 0xc1, 0xc1]).is_err());
    }

    #[test]
    fn test_write_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("trace.msgpack");
        write(&path, b"abc").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn test_write_failure_is_trace_output_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let err = write(&blocker.join("trace.msgpack"), b"abc").unwrap_err();
        assert!(matches!(err, RuntimeError::TraceOutput { .. }));
    }
}
