//! Source path validation.
//!
//! The source path is checked before anything touches the filesystem: a path
//! that does not name a file on a recognisable volume is rejected with
//! [`Error::InvalidPathFormat`] and no I/O is performed.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// How a backend expects source paths to be spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSyntax {
    /// `<DriveLetter>:\...`, the volume is named by the drive letter.
    Drive,
    /// `/...`, the volume is found from the mount hosting the path.
    Absolute,
}

impl PathSyntax {
    fn expected(self) -> &'static str {
        match self {
            PathSyntax::Drive => r"<DriveLetter>:\...",
            PathSyntax::Absolute => "an absolute path",
        }
    }
}

/// A validated source path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePath {
    path: PathBuf,
    drive: Option<char>,
}

impl SourcePath {
    /// Validate `raw` against `syntax`.
    pub fn parse(raw: &Path, syntax: PathSyntax) -> Result<Self> {
        let invalid = || Error::InvalidPathFormat {
            path: raw.to_path_buf(),
            expected: syntax.expected(),
        };

        match syntax {
            PathSyntax::Drive => {
                let text = raw.to_str().ok_or_else(invalid)?;
                let drive = parse_drive(text).ok_or_else(invalid)?;
                Ok(Self {
                    path: raw.to_path_buf(),
                    drive: Some(drive),
                })
            }
            PathSyntax::Absolute => {
                if !raw.has_root() {
                    return Err(invalid());
                }
                Ok(Self {
                    path: raw.to_path_buf(),
                    drive: None,
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upper-case drive letter, for drive-style paths.
    pub fn drive(&self) -> Option<char> {
        self.drive
    }

    /// Raw device path of the volume, e.g. `\\.\C:`.
    pub fn volume_device(&self) -> Option<PathBuf> {
        self.drive
            .map(|drive| PathBuf::from(format!(r"\\.\{drive}:")))
    }

    /// Root directory of the volume, e.g. `C:\`.
    pub fn volume_root(&self) -> Option<String> {
        self.drive.map(|drive| format!(r"{drive}:\"))
    }
}

fn parse_drive(text: &str) -> Option<char> {
    let mut chars = text.chars();
    let letter = chars.next().filter(char::is_ascii_alphabetic)?;
    if chars.next() != Some(':') || chars.next() != Some('\\') {
        return None;
    }
    Some(letter.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_path_accepted() {
        let source = SourcePath::parse(Path::new(r"c:\Windows\System32\config\SAM"), PathSyntax::Drive).unwrap();
        assert_eq!(source.drive(), Some('C'));
        assert_eq!(source.volume_device(), Some(PathBuf::from(r"\\.\C:")));
        assert_eq!(source.volume_root().as_deref(), Some(r"C:\"));
        assert_eq!(source.path(), Path::new(r"c:\Windows\System32\config\SAM"));
    }

    #[test]
    fn test_drive_path_rejected() {
        for raw in [
            "",
            "C",
            "C:",
            "C:/Windows",
            r"CD:\x",
            r"1:\x",
            r"\\?\C:\x",
            r"relative\path",
            "/etc/shadow",
        ] {
            let err = SourcePath::parse(Path::new(raw), PathSyntax::Drive).unwrap_err();
            assert!(
                matches!(err, Error::InvalidPathFormat { .. }),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_absolute_path() {
        let source = SourcePath::parse(Path::new("/var/lib/db/data.mdb"), PathSyntax::Absolute).unwrap();
        assert_eq!(source.drive(), None);
        assert_eq!(source.volume_device(), None);

        let err = SourcePath::parse(Path::new("data.mdb"), PathSyntax::Absolute).unwrap_err();
        assert!(matches!(err, Error::InvalidPathFormat { .. }));
    }
}
