//! Prometheus [file-based service discovery] output.
//!
//! [file-based service discovery]: https://prometheus.io/docs/guides/file-sd/

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{Error, Result, TargetGroup};

/// The published discovery file.
///
/// Every [`write`](SdFile::write) goes to a hidden sibling file that is then
/// renamed over the real path, so a reader sees either the previous complete
/// file or the new one.
#[derive(Debug, Clone)]
pub struct SdFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl SdFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tmp_path = tmp_path(&path);
        Self { path, tmp_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<'a, I>(&self, groups: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a TargetGroup>,
    {
        let groups = groups.into_iter().collect::<Vec<_>>();
        let result = self.write_tmp(&groups).and_then(|()| {
            fs::rename(&self.tmp_path, &self.path).map_err(|source| Error::Io {
                path: self.path.clone(),
                source,
            })
        });
        if result.is_err() {
            let _ = fs::remove_file(&self.tmp_path);
        }
        result
    }

    fn write_tmp(&self, groups: &[&TargetGroup]) -> Result<()> {
        let io_error = |source: io::Error| Error::Io {
            path: self.tmp_path.clone(),
            source,
        };
        let mut writer = BufWriter::new(create_private(&self.tmp_path).map_err(io_error)?);
        serde_json::to_writer(&mut writer, groups)?;
        writer.write_all(b"\n").map_err(io_error)?;
        let file = writer.into_inner().map_err(|e| io_error(e.into_error()))?;
        file.sync_all().map_err(io_error)
    }
}

// ./sd.json -> ./.sd.json.tmp
fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn create_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    fn group(target: &str) -> TargetGroup {
        TargetGroup::new([target], [("env", "prod")]).unwrap()
    }

    #[test]
    fn test_tmp_path() {
        assert_eq!(tmp_path(Path::new("./sd.json")), Path::new("./.sd.json.tmp"));
        assert_eq!(tmp_path(Path::new("sd.json")), Path::new(".sd.json.tmp"));
        assert_eq!(
            tmp_path(Path::new("/etc/prometheus/sd.json")),
            Path::new("/etc/prometheus/.sd.json.tmp")
        );
    }

    #[test]
    fn test_write() {
        let dir = tempfile::tempdir().unwrap();
        let sd_file = SdFile::new(dir.path().join("sd.json"));

        sd_file.write(&Vec::<TargetGroup>::new()).unwrap();
        expect![[r#"
            []
        "#]]
        .assert_eq(&fs::read_to_string(sd_file.path()).unwrap());

        let (a, b) = (group("a:1"), group("b:2"));
        sd_file.write([&a, &b]).unwrap();
        expect![[r#"
            [{"targets":["a:1"],"labels":{"env":"prod"}},{"targets":["b:2"],"labels":{"env":"prod"}}]
        "#]]
        .assert_eq(&fs::read_to_string(sd_file.path()).unwrap());

        assert!(!sd_file.tmp_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let sd_file = SdFile::new(dir.path().join("sd.json"));
        sd_file.write(&Vec::<TargetGroup>::new()).unwrap();
        let mode = fs::metadata(sd_file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_write_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sd_file = SdFile::new(dir.path().join("missing").join("sd.json"));
        assert!(matches!(
            sd_file.write(&Vec::<TargetGroup>::new()),
            Err(Error::Io { .. })
        ));
        assert!(!sd_file.path().exists());
    }

    #[test]
    fn test_failed_rename_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sd.json");
        // Renaming a file over a non-empty directory fails.
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"").unwrap();

        let sd_file = SdFile::new(&path);
        assert!(matches!(
            sd_file.write(&Vec::<TargetGroup>::new()),
            Err(Error::Io { .. })
        ));
        assert!(path.join("keep").exists());
        assert!(!sd_file.tmp_path.exists());
    }

    #[test]
    fn test_concurrent_reader_sees_complete_files() {
        let dir = tempfile::tempdir().unwrap();
        let sd_file = SdFile::new(dir.path().join("sd.json"));
        let groups = (0..200)
            .map(|i| group(&format!("host-{i}:9100")))
            .collect::<Vec<_>>();
        sd_file.write(&groups[..1]).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let path = sd_file.path().to_owned();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0;
                loop {
                    let data = fs::read(&path).unwrap();
                    let parsed: Vec<TargetGroup> = serde_json::from_slice(&data).unwrap();
                    assert!(!parsed.is_empty());
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        break reads;
                    }
                }
            })
        };

        for n in 1..=groups.len() {
            sd_file.write(&groups[..n]).unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
    }
}
