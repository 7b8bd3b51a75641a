use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("script not found")]
    ScriptNotFound,
}

/// What to execute for a request. Fixed command mode runs the same program
/// for every URL; script-directory mode dispatches on the request path.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    Command { name: String, args: Vec<String> },
    Dir { root: Utf8PathBuf },
}

/// Mapping of a request path onto the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlResolution {
    /// URL prefix that selected the script (`/` in fixed command mode).
    pub script_path: String,
    /// Trailing URL segments handed to the child as `PATH_INFO`.
    pub path_info: String,
    /// Script file on disk; empty in fixed command mode.
    pub file_path: Utf8PathBuf,
}

/// Map a request path to a script.
///
/// In script-directory mode the path segments are walked from the root,
/// stat-ing each accumulated prefix: the first non-directory entry is the
/// script and everything after it becomes `PATH_INFO`. A path whose terminal
/// segment is a directory, or any segment that does not stat, is not a
/// script. The resolved file always lies under the root: the walk joins
/// plain segments one by one, so the request cannot escape it.
pub fn resolve(path: &str, source: &ScriptSource) -> Result<UrlResolution, ResolveError> {
    let root = match source {
        ScriptSource::Command { .. } => {
            return Ok(UrlResolution {
                script_path: "/".to_owned(),
                path_info: path.to_owned(),
                file_path: Utf8PathBuf::new(),
            });
        }
        ScriptSource::Dir { root } => root,
    };

    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let mut script_path = String::new();
    let mut file_path = root.to_path_buf();

    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || *part == "." || *part == ".." {
            return Err(ResolveError::ScriptNotFound);
        }

        script_path.push('/');
        script_path.push_str(part);
        file_path.push(part);

        let is_last = i == parts.len() - 1;
        let metadata = std::fs::metadata(&file_path).map_err(|_| ResolveError::ScriptNotFound)?;

        if metadata.is_dir() {
            if is_last {
                return Err(ResolveError::ScriptNotFound);
            }
            continue;
        }

        let path_info = if is_last {
            String::new()
        } else {
            format!("/{}", parts[i + 1..].join("/"))
        };

        return Ok(UrlResolution {
            script_path,
            path_info,
            file_path,
        });
    }

    Err(ResolveError::ScriptNotFound)
}

impl UrlResolution {
    /// The program to launch for this resolution.
    pub fn command<'a>(&'a self, source: &'a ScriptSource) -> (&'a str, &'a [String]) {
        match source {
            ScriptSource::Command { name, args } => (name.as_str(), args.as_slice()),
            ScriptSource::Dir { .. } => (self.file_path.as_str(), &[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;

    fn dir_source(root: &Utf8Path) -> ScriptSource {
        ScriptSource::Dir {
            root: root.to_path_buf(),
        }
    }

    fn make_script_tree() -> (tempfile::TempDir, Utf8PathBuf) {
        let base = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(base.path().to_path_buf()).expect("utf-8 tempdir path");
        std::fs::create_dir_all(root.join("foo/bar")).expect("mkdir");
        std::fs::write(root.join("foo/bar/baz.sh"), "#!/bin/sh\n").expect("write script");
        (base, root)
    }

    #[test]
    fn fixed_command_mode_resolves_every_path() {
        let source = ScriptSource::Command {
            name: "cat".to_owned(),
            args: vec![],
        };

        let res = resolve("/some/path", &source).expect("always resolves");
        assert_eq!(res.script_path, "/");
        assert_eq!(res.path_info, "/some/path");
        assert_eq!(res.file_path, Utf8PathBuf::new());
    }

    #[test]
    fn script_dir_simple_url() {
        let (_base, root) = make_script_tree();
        let res = resolve("/foo/bar/baz.sh", &dir_source(&root)).expect("resolves");
        assert_eq!(res.script_path, "/foo/bar/baz.sh");
        assert_eq!(res.path_info, "");
        assert_eq!(res.file_path, root.join("foo/bar/baz.sh"));
    }

    #[test]
    fn script_dir_with_extra_path_info() {
        let (_base, root) = make_script_tree();
        let res = resolve("/foo/bar/baz.sh/extra/x", &dir_source(&root)).expect("resolves");
        assert_eq!(res.script_path, "/foo/bar/baz.sh");
        assert_eq!(res.path_info, "/extra/x");
        assert_eq!(res.file_path, root.join("foo/bar/baz.sh"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_base, root) = make_script_tree();
        assert!(matches!(
            resolve("/foo/bar/missing.sh", &dir_source(&root)),
            Err(ResolveError::ScriptNotFound)
        ));
    }

    #[test]
    fn missing_dir_is_not_found() {
        let (_base, root) = make_script_tree();
        assert!(matches!(
            resolve("/hoohar/bang.sh", &dir_source(&root)),
            Err(ResolveError::ScriptNotFound)
        ));
    }

    #[test]
    fn terminal_directory_is_not_found() {
        let (_base, root) = make_script_tree();
        assert!(matches!(
            resolve("/foo/bar", &dir_source(&root)),
            Err(ResolveError::ScriptNotFound)
        ));
    }

    #[test]
    fn dot_segments_cannot_escape_the_root() {
        let (_base, root) = make_script_tree();
        for path in ["/../etc/passwd", "/foo/../foo/bar/baz.sh", "/./foo"] {
            assert!(matches!(
                resolve(path, &dir_source(&root)),
                Err(ResolveError::ScriptNotFound)
            ));
        }
    }

    proptest::proptest! {
        /// Any path either resolves under the root or fails with
        /// `ScriptNotFound`; the resolver never panics and never yields a
        /// file outside the root.
        #[test]
        fn resolver_is_total(path in "/[a-zA-Z0-9_./-]{0,40}") {
            let (_base, root) = make_script_tree();
            match resolve(&path, &dir_source(&root)) {
                Ok(res) => {
                    proptest::prop_assert!(res.file_path.starts_with(&root));
                    proptest::prop_assert!(res.path_info.is_empty() || res.path_info.starts_with('/'));
                }
                Err(ResolveError::ScriptNotFound) => {}
            }
        }
    }
}
