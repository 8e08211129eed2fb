//! Minimal `/proc/self/maps` parsing, just enough to place the dedicated
//! stack above every existing stack mapping.

use std::fs::File;
use std::io::{BufRead, BufReader};

use crate::result::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    pub pathname: String,
}

impl Mapping {
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

fn parse_line(line: &str) -> Result<Mapping> {
    let mut fields = line.splitn(6, ' ');
    let range = fields
        .next()
        .ok_or_else(|| Error::ProcMaps(format!("empty line: {}", line)))?;
    let mut bounds = range.splitn(2, '-');
    let start = bounds
        .next()
        .and_then(|v| usize::from_str_radix(v, 16).ok())
        .ok_or_else(|| Error::ProcMaps(format!("bad start address: {}", range)))?;
    let end = bounds
        .next()
        .and_then(|v| usize::from_str_radix(v, 16).ok())
        .ok_or_else(|| Error::ProcMaps(format!("bad end address: {}", range)))?;

    // perms, offset, dev, inode are not interesting here
    let pathname = fields
        .nth(4)
        .map(|p| p.trim().to_string())
        .unwrap_or_default();

    Ok(Mapping {
        start,
        end,
        pathname,
    })
}

pub fn self_maps() -> Result<Vec<Mapping>> {
    let f = File::open("/proc/self/maps")
        .map_err(|e| Error::ProcMaps(format!("cannot open /proc/self/maps: {}", e)))?;
    let buf = BufReader::new(f);
    let mut maps = vec![];
    for line in buf.lines() {
        let line = line.map_err(|e| Error::ProcMaps(format!("read error: {}", e)))?;
        maps.push(parse_line(&line)?);
    }
    Ok(maps)
}

/// Highest end address of any `[stack]` mapping, or `None` if the kernel
/// does not label one.
pub fn stack_ceiling(maps: &[Mapping]) -> Option<usize> {
    maps.iter()
        .filter(|m| m.pathname == "[stack]")
        .map(|m| m.end)
        .max()
}
