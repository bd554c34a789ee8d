use std::path::Path;

use crate::error::{Result, StorageError};
use crate::model::UtcTime;

/// Rows count with the first and last row timestamps.
/// Persisted as plain text `count,firstRecordAt,lastRecordAt`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RowCount {
    pub count: u64,
    pub first_at: Option<UtcTime>,
    pub last_at: Option<UtcTime>,
}

impl RowCount {
    pub fn add(&mut self, at: UtcTime, n: u64) {
        self.count += n;
        self.first_at = Some(self.first_at.map_or(at, |f| f.min(at)));
        self.last_at = Some(self.last_at.map_or(at, |l| l.max(at)));
    }

    pub fn encode(&self) -> String {
        let t = |v: Option<UtcTime>| v.map(|t| t.to_string()).unwrap_or_default();
        format!("{},{},{}", self.count, t(self.first_at), t(self.last_at))
    }

    pub fn decode(s: &str) -> Result<Self> {
        let invalid = || StorageError::InvalidValue { column: "completed_count".into(), message: format!("unexpected content \"{}\"", s.trim()) };
        let mut parts = s.trim().split(',');
        let (Some(count), Some(first), Some(last), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        let time = |v: &str| -> Result<Option<UtcTime>> { if v.is_empty() { Ok(None) } else { v.parse().map(Some) } };
        Ok(Self { count: count.parse().map_err(|_| invalid())?, first_at: time(first)?, last_at: time(last)? })
    }

    /// Missing file means nothing was written yet.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) if s.trim().is_empty() => Ok(Self::default()),
            Ok(s) => Self::decode(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StorageError::io(format!("read counter backup {}", path.display()), e)),
        }
    }

    /// Replaces the backup atomically: temp file, then rename.
    pub fn store(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.encode()).map_err(|e| StorageError::io(format!("write counter backup {}", tmp.display()), e))?;
        std::fs::rename(&tmp, path).map_err(|e| StorageError::io(format!("rename counter backup {}", path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> UtcTime { s.parse().unwrap() }

    #[test]
    fn add_and_encode() -> Result<()> {
        let mut c = RowCount::default();
        assert_eq!(c.encode(), "0,,");
        c.add(t("2000-01-01T02:00:00.000Z"), 1);
        c.add(t("2000-01-01T01:00:00.000Z"), 2);
        assert_eq!(c.count, 3);
        assert_eq!(c.encode(), "3,2000-01-01T01:00:00.000Z,2000-01-01T02:00:00.000Z");
        assert_eq!(RowCount::decode(&c.encode())?, c);
        assert_eq!(RowCount::decode("0,,")?, RowCount::default());
        assert!(RowCount::decode("x,,").is_err());
        assert!(RowCount::decode("1,2").is_err());
        Ok(())
    }

    #[test]
    fn store_and_load() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("completed_count");
        assert_eq!(RowCount::load(&path)?, RowCount::default());
        let mut c = RowCount::default();
        c.add(t("2000-01-01T01:00:00.000Z"), 5);
        c.store(&path)?;
        assert_eq!(RowCount::load(&path)?, c);
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }
}
