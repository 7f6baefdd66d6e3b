//! Cooperative whole-file load and save.
//!
//! Transfers run in chunks with a yield to the scheduler between chunks, so
//! a coroutine can move a large file without starving the rest of the
//! runtime. Both helpers also work outside any coroutine, where they simply
//! run to completion.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use log::debug;

use crate::{in_coroutine, yield_now};

const CHUNK_SIZE: usize = 64 * 1024;

/// Read the whole file into a buffer. `None` on any I/O error.
pub fn load_file<P: AsRef<Path>>(path: P) -> Option<Vec<u8>> {
    let path = path.as_ref();
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            debug!("load {}: {}", path.display(), e);
            return None;
        }
    };
    let mut data = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                data.extend_from_slice(&chunk[..n]);
                if in_coroutine() {
                    yield_now();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("load {}: {}", path.display(), e);
                return None;
            }
        }
    }
    Some(data)
}

/// Write `data` to the file, creating or truncating it. `true` iff every
/// byte made it to the file.
pub fn save_file<P: AsRef<Path>>(path: P, data: &[u8]) -> bool {
    let path = path.as_ref();
    let mut file = match File::create(path) {
        Ok(f) => f,
        Err(e) => {
            debug!("save {}: {}", path.display(), e);
            return false;
        }
    };
    for chunk in data.chunks(CHUNK_SIZE) {
        if let Err(e) = file.write_all(chunk) {
            debug!("save {}: {}", path.display(), e);
            return false;
        }
        if in_coroutine() {
            yield_now();
        }
    }
    true
}
