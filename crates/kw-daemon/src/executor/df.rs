//! Remote command helpers

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parse `df -P -B1` output into `(total, used, available)` bytes
///
/// Only the last non-empty line is read, so a header row (or several
/// filesystems) is tolerated.
pub fn parse_df(output: &str) -> Result<(u64, u64, u64), String> {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| "empty df output".to_string())?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return Err(format!("unexpected df output: {}", line));
    }

    let number = |idx: usize| -> Result<u64, String> {
        fields[idx]
            .parse::<u64>()
            .map_err(|_| format!("unexpected df value '{}' in: {}", fields[idx], line))
    };

    Ok((number(1)?, number(2)?, number(3)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gnu_df() {
        let output = "Filesystem       1-blocks         Used    Available Capacity Mounted on\n\
                      /dev/sda1    536870912000 214748364800 322122547200      40% /srv\n";
        let (total, used, available) = parse_df(output).unwrap();
        assert_eq!(total, 536870912000);
        assert_eq!(used, 214748364800);
        assert_eq!(available, 322122547200);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_df("").is_err());
        assert!(parse_df("df: /nope: No such file or directory").is_err());
        assert!(parse_df("fs a b c 1% /").is_err());
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
