use anyhow::{anyhow, Result};
use memchr::{memchr, memchr_iter};
use memmap2::MmapOptions;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Header plus number of non-blank data lines of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCount {
    pub headers: Vec<String>,
    pub data_rows: u64,
}

/// Count data rows of an uncompressed local CSV using mmap and parallel chunking,
/// so an import can report a real percentage from its first batch.
/// Assumptions: UTF-8, `\n` line breaks, no embedded newlines in quoted fields.
pub fn count_rows_local(path: &Path, delimiter: u8) -> Result<LocalCount> {
    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Err(anyhow!("{} is empty", path.display()));
    }
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    let data: &[u8] = &mmap[..];

    // Header is the first non-blank line
    let mut header_start = 0usize;
    let header_end = loop {
        let end = memchr(b'\n', &data[header_start..])
            .map(|off| header_start + off)
            .unwrap_or(len);
        if !is_blank(&data[header_start..end]) || end == len {
            break end;
        }
        header_start = end + 1;
    };
    let header_line = trim_cr(&data[header_start..header_end]);
    let header_line = header_line.strip_prefix(b"\xef\xbb\xbf").unwrap_or(header_line);
    let headers = std::str::from_utf8(header_line)?
        .split(delimiter as char)
        .map(|h| h.trim().to_lowercase())
        .collect::<Vec<_>>();
    if headers.iter().all(String::is_empty) {
        return Err(anyhow!("{} has no header line", path.display()));
    }

    // Split the body at line boundaries, one slice per core
    let body_start = (header_end + 1).min(len);
    let cores = num_cpus::get().max(1);
    let approx = (len - body_start) / cores + 1;
    let mut starts = vec![body_start];
    while starts.len() < cores {
        let pos = body_start + starts.len() * approx;
        if pos >= len {
            break;
        }
        let next = memchr(b'\n', &data[pos..])
            .map(|off| pos + off + 1)
            .unwrap_or(len);
        if next > *starts.last().unwrap_or(&body_start) && next < len {
            starts.push(next);
        } else {
            break;
        }
    }
    starts.push(len);

    let total = AtomicU64::new(0);
    thread::scope(|s| {
        for w in starts.windows(2) {
            let slice = &data[w[0]..w[1]];
            let total = &total;
            s.spawn(move || {
                let mut count = 0u64;
                let mut cursor = 0usize;
                for nl in memchr_iter(b'\n', slice) {
                    if !is_blank(&slice[cursor..nl]) {
                        count += 1;
                    }
                    cursor = nl + 1;
                }
                // last line without a trailing newline
                if cursor < slice.len() && !is_blank(&slice[cursor..]) {
                    count += 1;
                }
                total.fetch_add(count, Ordering::Relaxed);
            });
        }
    });

    Ok(LocalCount {
        headers,
        data_rows: total.load(Ordering::Relaxed),
    })
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}
