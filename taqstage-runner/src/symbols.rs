//! Symbol list input: a file with one symbol per line or a comma list.

use std::fs;
use std::io;
use std::path::Path;

/// Trim, upper-case and de-duplicate, keeping first-seen order.
pub fn normalize<I, S>(symbols: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for s in symbols {
        let s = s.as_ref().trim().to_uppercase();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

/// One symbol per line. Blank lines and `#` comments are ignored.
pub fn read_symbol_file(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(normalize(
        content
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default()),
    ))
}

/// A path to an existing file, otherwise a comma-separated list.
pub fn parse_symbol_arg(arg: &str) -> io::Result<Vec<String>> {
    let path = Path::new(arg.trim());
    if path.is_file() {
        read_symbol_file(path)
    } else {
        Ok(normalize(arg.split(',')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn comma_list_is_normalized() {
        assert_eq!(
            parse_symbol_arg(" aapl, msft ,,AAPL,brk.b").unwrap(),
            vec!["AAPL", "MSFT", "BRK.B"]
        );
    }

    #[test]
    fn file_lines_are_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("universe.txt");
        fs::write(&path, "spy\n# sector ETFs\nxlk  # tech\n\nqqq\n").unwrap();
        assert_eq!(
            parse_symbol_arg(path.to_str().unwrap()).unwrap(),
            vec!["SPY", "XLK", "QQQ"]
        );
    }
}
