use std::io::Write;

use turbopath::AbsoluteSystemPath;

use crate::Error;

/// Replays a captured task log file through the given writer, byte for byte.
/// The writer is expected to apply any prefixing.
pub fn replay_logs<W: Write>(mut output: W, log_file: &AbsoluteSystemPath) -> Result<(), Error> {
    let bytes = log_file.read().map_err(Error::CannotReadLogs)?;
    output.write_all(&bytes).map_err(Error::CannotWriteLogs)?;
    output.flush().map_err(Error::CannotWriteLogs)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_replay_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let log_file = root.join_component("turbo-build.log");
        log_file.create_with_contents("line one\nline two\n")?;

        let mut replayed = Vec::new();
        replay_logs(&mut replayed, &log_file)?;
        assert_eq!(replayed, b"line one\nline two\n");
        Ok(())
    }

    #[test]
    fn test_replay_missing_file_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let log_file = root.join_component("does-not-exist.log");

        let mut replayed = Vec::new();
        assert!(replay_logs(&mut replayed, &log_file).is_err());
        Ok(())
    }
}
