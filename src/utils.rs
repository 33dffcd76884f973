//! Utility functions.

/// Format a byte count with binary units, for logs and status lines.
pub fn to_human_readable(mut n: f64) -> String {
    const UNITS: [&str; 9] =
        ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

    let mut unit = 0;
    while (n * 10.0).round() / 10.0 >= 1024.0 && unit < UNITS.len() - 1 {
        n /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{n:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_size() {
        assert_eq!(to_human_readable(0.0), "0 B");
        assert_eq!(to_human_readable(512.0), "512 B");
        assert_eq!(to_human_readable(2048.0), "2.00 KiB");
        assert_eq!(to_human_readable(495353.0), "483.74 KiB");
        assert_eq!(to_human_readable(30_178_876.0), "28.78 MiB");
        assert_eq!(to_human_readable(2_093_903_856.0), "1.95 GiB");
    }
}
