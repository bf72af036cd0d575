//! Kernel ring buffer reader.
//!
//! # Design Decisions
//! - The cursor is the kernel timestamp (microseconds) of the last consumed
//!   line plus how many lines with that stamp were consumed, so clearing or
//!   rotating the ring buffer never replays old lines and a line sharing the
//!   stamp of an earlier read is still delivered
//! - Lines without a timestamp belong to the stamped line before them

use std::process::Command;

use crate::device::{LogCursor, LogError, LogSource};

/// `LogSource` backed by the `dmesg` command.
#[derive(Debug, Clone)]
pub struct DmesgLog {
    program: String,
}

impl DmesgLog {
    pub fn new() -> Self {
        Self {
            program: "dmesg".to_string(),
        }
    }

    fn read_all(&self) -> Result<String, LogError> {
        let output = Command::new(&self.program).output()?;
        if !output.status.success() {
            return Err(LogError::Reader(output.status.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DmesgLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSource for DmesgLog {
    fn tail_since(&mut self, cursor: LogCursor) -> Result<(Vec<String>, LogCursor), LogError> {
        let text = self.read_all()?;
        Ok(select_after(&text, cursor))
    }
}

/// Parse the `[ 1234.567890]` prefix into microseconds.
pub(crate) fn parse_timestamp(line: &str) -> Option<u64> {
    let rest = line.trim_start().strip_prefix('[')?;
    let (stamp, _) = rest.split_once(']')?;
    let (secs, frac) = stamp.trim().split_once('.')?;
    let secs: u64 = secs.parse().ok()?;
    // dmesg prints six fractional digits; pad or cut to microseconds.
    let mut micros = String::from(frac);
    micros.truncate(6);
    while micros.len() < 6 {
        micros.push('0');
    }
    let micros: u64 = micros.parse().ok()?;
    Some(secs * 1_000_000 + micros)
}

fn select_after(text: &str, cursor: LogCursor) -> (Vec<String>, LogCursor) {
    let mut lines = Vec::new();
    let mut newest = cursor;
    let mut taking = false;
    // Position of the current line among lines sharing its timestamp.
    let mut run: Option<(u64, u32)> = None;

    for line in text.lines() {
        match parse_timestamp(line) {
            Some(ts) => {
                let index = match run {
                    Some((prev, index)) if prev == ts => index + 1,
                    _ => 0,
                };
                run = Some((ts, index));
                taking = cursor.precedes(ts, index);
                let next = LogCursor::after(ts, index);
                if taking && next > newest {
                    newest = next;
                }
            }
            None => {
                // Continuation line: follows whatever its parent decided.
            }
        }
        if taking {
            lines.push(line.to_string());
        }
    }

    (lines, newest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
[  100.000001] pci 0004:01:00.0: enabling device
[  200.500000] pcieport 0004:00:00.0: AER: Uncorrected (Non-Fatal) error received: 0004:01:00.0
[  200.500010] ath12k_pci 0004:01:00.0: PCIe Bus Error: severity=Uncorrected (Non-Fatal), type=Transaction Layer, (Requester ID)
[  200.500020] ath12k_pci 0004:01:00.0:   device [17cb:1107] error status/mask=00004000/00400000
[  200.500030] ath12k_pci 0004:01:00.0:    [14] CmpltTO                (First)
";

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("[  100.000001] x"), Some(100_000_001));
        assert_eq!(parse_timestamp("[5.5] x"), Some(5_500_000));
        assert_eq!(parse_timestamp("no stamp"), None);
    }

    #[test]
    fn test_select_after_cursor() {
        let (all, end) = select_after(LOG, LogCursor::default());
        assert_eq!(all.len(), 5);
        assert_eq!(end, LogCursor::after(200_500_030, 0));

        let (tail, next) = select_after(LOG, LogCursor::after(200_500_000, 0));
        assert_eq!(tail.len(), 3);
        assert!(tail[2].contains("CmpltTO"));
        assert_eq!(next, end);

        let (none, same) = select_after(LOG, end);
        assert!(none.is_empty());
        assert_eq!(same, end);
    }

    #[test]
    fn test_continuation_lines_follow_parent() {
        let text = "[1.000000] old\n  old detail\n[2.000000] new\n  new detail\n";
        let (lines, _) = select_after(text, LogCursor::after(1_000_000, 0));
        assert_eq!(lines, vec!["[2.000000] new", "  new detail"]);
    }

    #[test]
    fn test_line_sharing_the_last_stamp_is_not_lost() {
        let first = "[7.000100] pcieport 0000:00:1c.0: AER: error received\n";
        let (lines, cursor) = select_after(first, LogCursor::default());
        assert_eq!(lines.len(), 1);
        assert_eq!(cursor, LogCursor::after(7_000_100, 0));

        // The detail line landed in the same microsecond, after the read.
        let later = "[7.000100] pcieport 0000:00:1c.0: AER: error received\n\
                     [7.000100] simdev 0000:01:00.0:    [14] CmpltTO\n";
        let (lines, cursor) = select_after(later, cursor);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("CmpltTO"));
        assert_eq!(cursor, LogCursor::after(7_000_100, 1));

        let (lines, same) = select_after(later, cursor);
        assert!(lines.is_empty());
        assert_eq!(same, cursor);
    }
}
