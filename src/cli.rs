use clap::Parser;
use std::path::PathBuf;

/// Back up directory trees to object storage, or restore them.
///
/// Files are uploaded when they don't exist remotely or were modified since
/// the last upload; restore downloads objects that are missing locally or
/// whose local copy is older and different.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Directories to back up (or, with `--restore`, the single restore
    /// target). Defaults to the configured `sources`.
    #[arg(value_name = "DIRECTORY")]
    pub directories: Vec<PathBuf>,

    /// Restore from the container instead of backing up to it.
    #[arg(long)]
    pub restore: bool,

    /// Path to the configuration file.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (can be specified multiple times).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Command line directories win over configured sources.
    pub fn directories_or(&self, configured: &[PathBuf]) -> Vec<PathBuf> {
        if self.directories.is_empty() { configured.to_vec() } else { self.directories.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["coffer"], false, 0, 0)]
    #[case(&["coffer", "/srv/a", "/srv/b"], false, 2, 0)]
    #[case(&["coffer", "--restore", "/restore", "-vv"], true, 1, 2)]
    fn test_parse(#[case] args: &[&str], #[case] restore: bool, #[case] directories: usize, #[case] verbose: u8) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.restore, restore);
        assert_eq!(cli.directories.len(), directories);
        assert_eq!(cli.verbose, verbose);
    }

    #[test]
    fn test_directories_fall_back_to_configured() {
        let configured = vec![PathBuf::from("/configured")];
        let cli = Cli::try_parse_from(["coffer"]).unwrap();
        assert_eq!(cli.directories_or(&configured), configured);
        let cli = Cli::try_parse_from(["coffer", "/given"]).unwrap();
        assert_eq!(cli.directories_or(&configured), vec![PathBuf::from("/given")]);
    }
}
