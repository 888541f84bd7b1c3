use std::{fs, path::Path};

use regex::Regex;

use crate::error::{DebuggerError, Result};

/// Lowest address at which `executable_path` is mapped into process `pid`.
pub fn get_load_addr(pid: i32, executable_path: &Path) -> Result<u64> {
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid))?;

    // the kernel prints the resolved absolute path
    let path = fs::canonicalize(executable_path).unwrap_or_else(|_| executable_path.to_owned());
    let path = path.to_string_lossy();

    load_addr_from_maps(&maps, &path)
        .ok_or_else(|| DebuggerError::LoadAddress(path.into_owned()))
}

/// Parses the text of a `/proc/<pid>/maps` file.
pub fn load_addr_from_maps(maps: &str, executable_path: &str) -> Option<u64> {
    let regexp = Regex::new(&format!(
        r"(?m)^([0-9a-f]+)-[0-9a-f]+ .*\s{}$",
        regex::escape(executable_path)
    ))
    .ok()?;

    regexp
        .captures_iter(maps)
        .filter_map(|c| c.get(1))
        .filter_map(|addr| u64::from_str_radix(addr.as_str(), 16).ok())
        .min()
}
