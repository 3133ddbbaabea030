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

    // Small files are read whole.
    if file_size <= BUFFER_SIZE as u64 {
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        return Ok(extract_last_lines(&content, lines));
    }

    // Walk backwards chunk by chunk until enough newlines were seen.
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
    // A trailing newline leaves one empty slot at the end.
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

    fn log_with_lines(n: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..n {
            writeln!(file, "line {}", i).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_empty_file() {
        let file = NamedTempFile::new().unwrap();
        assert!(read_last_lines(file.path(), 10).unwrap().is_empty());
    }

    #[test]
    fn test_fewer_lines_than_requested() {
        let file = log_with_lines(3);
        let lines = read_last_lines(file.path(), 10).unwrap();
        assert_eq!(lines, vec!["line 0", "line 1", "line 2"]);
    }

    #[test]
    fn test_exact_tail_of_small_file() {
        let file = log_with_lines(10);
        let lines = read_last_lines(file.path(), 3).unwrap();
        assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_large_file_spanning_chunks() {
        // Force multiple 4096-byte chunks.
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..2000 {
            writeln!(file, "entry number {:06}", i).unwrap();
        }
        file.flush().unwrap();

        let lines = read_last_lines(file.path(), 5).unwrap();
        assert_eq!(
            lines,
            vec![
                "entry number 001995",
                "entry number 001996",
                "entry number 001997",
                "entry number 001998",
                "entry number 001999",
            ]
        );
    }

    #[test]
    fn test_file_without_trailing_newline() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "a\nb\nc").unwrap();
        file.flush().unwrap();

        let lines = read_last_lines(file.path(), 2).unwrap();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn test_missing_file() {
        assert!(read_last_lines(Path::new("/nonexistent/log"), 5).is_err());
    }
}
