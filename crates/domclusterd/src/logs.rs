// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reverse block-read of the process log for the `logs` CLI command.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const BUFFER_SIZE: usize = 4096;

/// Read the last `lines` lines of `path` without loading the whole file.
pub fn read_last_lines(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let mut file = std::fs::File::open(path)?;
    let file_size = file.metadata()?.len();

    if file_size == 0 {
        return Ok(Vec::new());
    }

    if file_size <= BUFFER_SIZE as u64 {
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        return Ok(extract_last_lines(&content, lines));
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut line_count = 0usize;
    let mut offset = file_size;

    while offset > 0 {
        let chunk_size = std::cmp::min(BUFFER_SIZE as u64, offset) as usize;
        offset -= chunk_size as u64;

        file.seek(SeekFrom::Start(offset))?;
        let mut chunk = vec![0u8; chunk_size];
        file.read_exact(&mut chunk)?;

        for i in (0..chunk_size).rev() {
            if chunk[i] == b'\n' {
                line_count += 1;
                if line_count > lines {
                    let mut tail = chunk[i + 1..].to_vec();
                    tail.extend_from_slice(&buf);
                    let content = String::from_utf8_lossy(&tail);
                    return Ok(extract_last_lines(&content, lines));
                }
            }
        }

        let mut joined = chunk;
        joined.extend_from_slice(&buf);
        buf = joined;
    }

    let content = String::from_utf8_lossy(&buf);
    Ok(extract_last_lines(&content, lines))
}

fn extract_last_lines(content: &str, lines: usize) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }

    let mut all: Vec<&str> = content.split('\n').collect();
    if all.last() == Some(&"") {
        all.pop();
    }

    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_tail_of_small_file() {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..5 {
            writeln!(file, "line {}", i).unwrap();
        }
        file.flush().unwrap();

        let lines = read_last_lines(file.path(), 2).unwrap();
        assert_eq!(lines, vec!["line 3", "line 4"]);
    }

    #[test]
    fn test_tail_spanning_chunks() {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..1500 {
            writeln!(file, "log entry {:05}", i).unwrap();
        }
        file.flush().unwrap();

        let lines = read_last_lines(file.path(), 3).unwrap();
        assert_eq!(
            lines,
            vec!["log entry 01497", "log entry 01498", "log entry 01499"]
        );
    }

    #[test]
    fn test_empty_file() {
        let file = NamedTempFile::new().unwrap();
        assert!(read_last_lines(file.path(), 10).unwrap().is_empty());
    }
}
