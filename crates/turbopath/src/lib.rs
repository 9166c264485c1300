#![deny(clippy::all)]
//! Path types that encode what a path is relative to.
//!
//! `AbsoluteSystemPath` is rooted at the filesystem root, uses the system
//! separator, and is the only type we hand to `std::fs`. `AnchoredSystemPath`
//! is relative to some anchor (almost always the repo root) and is what we
//! store in cache artifacts. `RelativeUnixPath` always uses `/` and is what
//! we feed to hashes so they are identical across platforms.

use std::{
    fmt, fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    #[error("path {0} is not anchored at {1}")]
    NotAnchored(String, String),
    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

macro_rules! unsized_path_type {
    ($ref_ty:ident, $buf_ty:ident) => {
        #[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $ref_ty(Utf8Path);

        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $buf_ty(Utf8PathBuf);

        impl $ref_ty {
            fn new_unchecked(path: &Utf8Path) -> &Self {
                // SAFETY: $ref_ty is repr(transparent) over Utf8Path
                unsafe { &*(path as *const Utf8Path as *const Self) }
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            pub fn as_std_path(&self) -> &Path {
                self.0.as_std_path()
            }

            pub fn to_owned(&self) -> $buf_ty {
                $buf_ty(self.0.to_owned())
            }
        }

        impl std::ops::Deref for $buf_ty {
            type Target = $ref_ty;

            fn deref(&self) -> &Self::Target {
                $ref_ty::new_unchecked(self.0.as_path())
            }
        }

        impl std::borrow::Borrow<$ref_ty> for $buf_ty {
            fn borrow(&self) -> &$ref_ty {
                self
            }
        }

        impl AsRef<$ref_ty> for $buf_ty {
            fn as_ref(&self) -> &$ref_ty {
                self
            }
        }

        impl fmt::Display for $ref_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl fmt::Display for $buf_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

unsized_path_type!(AbsoluteSystemPath, AbsoluteSystemPathBuf);
unsized_path_type!(AnchoredSystemPath, AnchoredSystemPathBuf);
unsized_path_type!(RelativeUnixPath, RelativeUnixPathBuf);

impl AbsoluteSystemPath {
    pub fn new(path: &str) -> Result<&Self, PathError> {
        let path = Utf8Path::new(path);
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path = Utf8Path::from_path(path)
            .ok_or_else(|| PathError::InvalidUtf8(path.to_string_lossy().into_owned()))?;
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn join_component(&self, component: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!component.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf(self.0.join(component))
    }

    pub fn join_components(&self, components: &[&str]) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_path_buf();
        for component in components {
            path.push(component);
        }
        AbsoluteSystemPathBuf(path)
    }

    /// Resolves an anchored path against this path as the anchor.
    pub fn resolve(&self, path: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf(self.0.join(&path.0))
    }

    /// Produces the anchored path of `path` relative to `self`. Errors if
    /// `path` is not underneath `self`.
    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        let stripped = path
            .0
            .strip_prefix(&self.0)
            .map_err(|_| PathError::NotAnchored(path.to_string(), self.to_string()))?;
        Ok(AnchoredSystemPathBuf(stripped.to_owned()))
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn exists(&self) -> bool {
        self.0.as_std_path().exists()
    }

    pub fn is_dir(&self) -> bool {
        self.0.as_std_path().is_dir()
    }

    pub fn create_dir_all(&self) -> Result<(), io::Error> {
        fs::create_dir_all(self.0.as_std_path())
    }

    /// Ensures the parent directory of this path exists.
    pub fn ensure_dir(&self) -> Result<(), io::Error> {
        match self.0.parent() {
            Some(parent) => fs::create_dir_all(parent.as_std_path()),
            None => Ok(()),
        }
    }

    pub fn create_with_contents(&self, contents: impl AsRef<[u8]>) -> Result<(), io::Error> {
        let mut f = fs::File::create(self.0.as_std_path())?;
        f.write_all(contents.as_ref())
    }

    pub fn read_to_string(&self) -> Result<String, io::Error> {
        fs::read_to_string(self.0.as_std_path())
    }

    pub fn read(&self) -> Result<Vec<u8>, io::Error> {
        let mut buffer = Vec::new();
        fs::File::open(self.0.as_std_path())?.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    pub fn open(&self) -> Result<fs::File, io::Error> {
        fs::File::open(self.0.as_std_path())
    }

    pub fn create(&self) -> Result<fs::File, io::Error> {
        fs::File::create(self.0.as_std_path())
    }

    pub fn remove_file(&self) -> Result<(), io::Error> {
        fs::remove_file(self.0.as_std_path())
    }

    pub fn rename(&self, other: &AbsoluteSystemPath) -> Result<(), io::Error> {
        fs::rename(self.0.as_std_path(), other.0.as_std_path())
    }

    pub fn symlink_metadata(&self) -> Result<fs::Metadata, io::Error> {
        fs::symlink_metadata(self.0.as_std_path())
    }

    pub fn read_link(&self) -> Result<PathBuf, io::Error> {
        fs::read_link(self.0.as_std_path())
    }

    #[cfg(unix)]
    pub fn symlink_to(&self, target: &str) -> Result<(), io::Error> {
        std::os::unix::fs::symlink(target, self.0.as_std_path())
    }

    #[cfg(windows)]
    pub fn symlink_to(&self, target: &str) -> Result<(), io::Error> {
        std::os::windows::fs::symlink_file(target, self.0.as_std_path())
    }
}

impl AbsoluteSystemPathBuf {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(Self(path))
    }

    /// Anchors `unknown` at `base` if relative, otherwise takes it verbatim.
    /// The result is cleaned of `.` and `..` components.
    pub fn from_unknown(base: &AbsoluteSystemPath, unknown: impl AsRef<str>) -> Self {
        use path_clean::PathClean;
        let unknown = Utf8Path::new(unknown.as_ref());
        let absolute = if unknown.is_absolute() {
            unknown.to_owned()
        } else {
            base.0.join(unknown)
        };
        let cleaned = absolute.as_std_path().clean();
        Self(
            Utf8PathBuf::from_path_buf(cleaned)
                .expect("cleaning a utf8 path yields a utf8 path"),
        )
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl AnchoredSystemPath {
    pub fn new(path: &str) -> Result<&Self, PathError> {
        let path = Utf8Path::new(path);
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn components(&self) -> impl Iterator<Item = Utf8Component<'_>> {
        self.0.components()
    }

    /// Converts to a unix-separator path for hashing and wire formats.
    pub fn to_unix(&self) -> RelativeUnixPathBuf {
        #[cfg(windows)]
        let unix = self.0.as_str().replace('\\', "/");
        #[cfg(not(windows))]
        let unix = self.0.as_str().to_owned();
        RelativeUnixPathBuf(Utf8PathBuf::from(unix))
    }

    pub fn join_component(&self, component: &str) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf(self.0.join(component))
    }

    pub fn join(&self, other: &AnchoredSystemPath) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf(self.0.join(&other.0))
    }
}

impl AnchoredSystemPathBuf {
    pub fn from_raw(path: impl AsRef<str>) -> Result<Self, PathError> {
        AnchoredSystemPath::new(path.as_ref()).map(|p| p.to_owned())
    }

    /// The anchored path between two absolute paths, supporting targets that
    /// are not underneath the anchor by emitting `..` components.
    pub fn relative_path_between(from: &AbsoluteSystemPath, to: &AbsoluteSystemPath) -> Self {
        let from_components: Vec<_> = from.0.components().collect();
        let to_components: Vec<_> = to.0.components().collect();
        let common = from_components
            .iter()
            .zip(to_components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let mut path = Utf8PathBuf::new();
        for _ in common..from_components.len() {
            path.push("..");
        }
        for component in &to_components[common..] {
            path.push(component);
        }
        Self(path)
    }
}

impl RelativeUnixPath {
    pub fn new(path: &str) -> Result<&Self, PathError> {
        let path = Utf8Path::new(path);
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }
}

impl RelativeUnixPathBuf {
    pub fn from_raw(path: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        Ok(Self(path))
    }

    /// Reinterprets the unix path with system separators.
    pub fn to_anchored_system_path_buf(&self) -> AnchoredSystemPathBuf {
        #[cfg(windows)]
        let system = self.0.as_str().replace('/', "\\");
        #[cfg(not(windows))]
        let system = self.0.as_str().to_owned();
        AnchoredSystemPathBuf(Utf8PathBuf::from(system))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn abs(s: &str) -> &'static AbsoluteSystemPath {
        Box::leak(Box::new(AbsoluteSystemPathBuf::new(s.to_owned()).unwrap()))
    }

    #[test]
    fn test_absolute_rejects_relative() {
        assert!(AbsoluteSystemPath::new("relative/path").is_err());
        assert!(AbsoluteSystemPathBuf::new("also/relative").is_err());
    }

    #[test]
    fn test_anchor_and_resolve_roundtrip() {
        let root = abs("/repo");
        let file = root.join_components(&["packages", "util", "index.js"]);
        let anchored = root.anchor(&file).unwrap();
        assert_eq!(anchored.as_str(), "packages/util/index.js");
        assert_eq!(root.resolve(&anchored), file);
    }

    #[test]
    fn test_anchor_outside_root_fails() {
        let root = abs("/repo");
        let outside = abs("/elsewhere/file.txt");
        assert!(root.anchor(outside).is_err());
    }

    #[test]
    fn test_from_unknown_cleans() {
        let root = abs("/repo");
        let joined = AbsoluteSystemPathBuf::from_unknown(root, "packages/../cache");
        assert_eq!(joined.as_str(), "/repo/cache");
        let absolute = AbsoluteSystemPathBuf::from_unknown(root, "/somewhere/else");
        assert_eq!(absolute.as_str(), "/somewhere/else");
    }

    #[test]
    fn test_relative_path_between() {
        let from = abs("/repo/packages/util");
        let to = abs("/repo");
        let rel = AnchoredSystemPathBuf::relative_path_between(from, to);
        assert_eq!(rel.to_unix().as_str(), "../..");
    }

    #[test]
    fn test_create_and_read() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let file = root.join_component("greeting.txt");
        file.create_with_contents("hello")?;
        assert_eq!(file.read_to_string()?, "hello");
        let nested = root.join_components(&["a", "b", "c.txt"]);
        nested.ensure_dir()?;
        nested.create_with_contents("nested")?;
        assert_eq!(nested.read_to_string()?, "nested");
        Ok(())
    }
}
