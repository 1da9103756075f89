//! Emergency backup files
//!
//! One `.obak` file per unit, holding a streamed MessagePack sequence of
//! [`RawRecord`]s. Written by the engine's emergency shutdown and read back
//! by the restore utilities.

use gridstore_core::{Error, RawRecord, Result};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::info;

/// File extension of backup files.
pub const BACKUP_EXTENSION: &str = "obak";

/// A single-unit backup file.
pub struct BackupFile {
    path: PathBuf,
    unit: String,
}

impl BackupFile {
    /// Backup file for a unit inside a backup directory.
    pub fn new(dir: &Path, unit: &str) -> Self {
        BackupFile {
            path: dir.join(format!("{unit}.{BACKUP_EXTENSION}")),
            unit: unit.to_string(),
        }
    }

    /// Open an existing backup file; None when the path is not a backup.
    pub fn open(path: &Path) -> Option<Self> {
        if !is_backup(path) {
            return None;
        }
        let unit = path.file_stem()?.to_str()?.to_string();
        Some(BackupFile {
            path: path.to_path_buf(),
            unit,
        })
    }

    /// Unit this file backs up.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a stream of records, replacing any existing file. Returns the
    /// record count.
    pub fn write<I>(&self, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = RawRecord>,
    {
        let mut writer = BufWriter::new(File::create(&self.path)?);
        let mut written = 0usize;
        for record in records {
            rmp_serde::encode::write(&mut writer, &record)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            written += 1;
        }
        io::Write::flush(&mut writer)?;
        info!(unit = %self.unit, records = written, "backup written");
        Ok(written)
    }

    /// Stream every record through the callback. Returns the record count.
    pub fn read(&self, callback: &mut dyn FnMut(RawRecord) -> Result<()>) -> Result<usize> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut count = 0usize;
        loop {
            match rmp_serde::decode::from_read::<_, RawRecord>(&mut reader) {
                Ok(record) => {
                    callback(record)?;
                    count += 1;
                }
                Err(rmp_serde::decode::Error::InvalidMarkerRead(ref e))
                    if e.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(Error::Serialization(e.to_string())),
            }
        }
        Ok(count)
    }
}

/// True when the path looks like a backup file.
pub fn is_backup(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(BACKUP_EXTENSION)
}

/// Every backup file in a directory, sorted by unit name.
pub fn backups_in(dir: &Path) -> Result<Vec<BackupFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(backup) = BackupFile::open(&path) {
            files.push(backup);
        }
    }
    files.sort_by(|a, b| a.unit.cmp(&b.unit));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(unit: &str, id: i64) -> RawRecord {
        RawRecord {
            unit_name: unit.to_string(),
            id_generator_name: unit.to_string(),
            id,
            last_update: None,
            entity_name: "Account".to_string(),
            payload: format!("{{\"id\":{id}}}"),
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::new(dir.path(), "Account___0");
        let records = vec![raw("Account___0", 1), raw("Account___0", 2)];
        assert_eq!(backup.write(records.clone()).unwrap(), 2);

        let mut read_back = Vec::new();
        let count = backup
            .read(&mut |r| {
                read_back.push(r);
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(read_back, records);
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::new(dir.path(), "Empty___0");
        assert_eq!(backup.write(Vec::new()).unwrap(), 0);
        assert_eq!(backup.read(&mut |_| Ok(())).unwrap(), 0);
    }

    #[test]
    fn test_is_backup_and_open() {
        assert!(is_backup(Path::new("/tmp/Account___0.obak")));
        assert!(!is_backup(Path::new("/tmp/Account___0.json")));
        let backup = BackupFile::open(Path::new("/tmp/Account___0.obak")).unwrap();
        assert_eq!(backup.unit(), "Account___0");
        assert!(BackupFile::open(Path::new("/tmp/readme.txt")).is_none());
    }

    #[test]
    fn test_backups_in_sorted() {
        let dir = tempfile::tempdir().unwrap();
        BackupFile::new(dir.path(), "Order___0")
            .write(vec![raw("Order___0", 1)])
            .unwrap();
        BackupFile::new(dir.path(), "Account___0")
            .write(vec![raw("Account___0", 1)])
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        let files = backups_in(dir.path()).unwrap();
        let units: Vec<&str> = files.iter().map(|f| f.unit()).collect();
        assert_eq!(units, vec!["Account___0", "Order___0"]);
    }

    #[test]
    fn test_callback_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::new(dir.path(), "Account___0");
        backup.write(vec![raw("Account___0", 1)]).unwrap();
        let result = backup.read(&mut |_| Err(Error::Provider("boom".to_string())));
        assert!(result.is_err());
    }
}
