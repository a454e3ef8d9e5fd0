//! Index data model.

mod device;
mod file;
mod folder;
mod index;

pub use device::DeviceInfo;
pub use file::{check_blocks, FileBlocks, FileInfo, FileType, Version};
pub use folder::{FolderInfo, FolderStats};
pub use index::IndexInfo;

/// Formats a byte count for display (`1.5 MiB`).
pub fn describe_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_size() {
        assert_eq!(describe_size(0), "0 B");
        assert_eq!(describe_size(1023), "1023 B");
        assert_eq!(describe_size(1536), "1.5 KiB");
        assert_eq!(describe_size(3 * 1024 * 1024), "3.0 MiB");
    }
}
