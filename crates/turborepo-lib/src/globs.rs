//! Glob expansion against a base directory, shared by the hashing pipeline
//! (inputs) and the run cache (outputs).

use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid glob: {0}")]
    InvalidGlob(#[from] globwalk::GlobError),
    #[error("Error walking globs: {0}")]
    Walk(#[from] globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

/// Expands the inclusion globs minus the exclusion globs at `base`,
/// returning matched files (not directories) anchored at `base`, sorted.
pub fn globwalk_files(
    base: &AbsoluteSystemPath,
    inclusions: &[String],
    exclusions: &[String],
) -> Result<Vec<AnchoredSystemPathBuf>, Error> {
    if inclusions.is_empty() || !base.is_dir() {
        return Ok(Vec::new());
    }

    let mut patterns = inclusions.to_vec();
    patterns.extend(exclusions.iter().map(|exclusion| format!("!{exclusion}")));

    let walker = globwalk::GlobWalkerBuilder::from_patterns(base.as_std_path(), &patterns)
        .follow_links(false)
        .build()?;

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = AbsoluteSystemPath::from_std_path(entry.path())?;
        files.push(base.anchor(path)?);
    }
    files.sort();
    Ok(files)
}
