use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod check;
pub mod deploy;
pub mod rollback;

#[derive(Parser)]
#[command(
    name = "berth",
    version,
    about = "Build and roll out containers on remote Docker hosts"
)]
pub struct Cli {
    /// Path to berth.toml
    #[arg(short, long, default_value = "berth.toml")]
    pub config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate berth.toml and list servers and applications
    Check,

    /// Deploy an application and follow it until it settles
    Deploy(DeployArgs),

    /// Redeploy an earlier commit, reusing its image when present
    Rollback {
        /// Application name
        #[arg(short, long)]
        app: String,
        /// Commit to go back to
        #[arg(long)]
        commit: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Application name
    #[arg(short, long)]
    pub app: String,
    /// Commit to deploy; the branch head when omitted
    #[arg(long)]
    pub commit: Option<String>,
    /// Deploy a pull request preview
    #[arg(long)]
    pub pr: Option<u64>,
    /// Build even when an image for the commit exists
    #[arg(long)]
    pub force_rebuild: bool,
    /// Restart with the current image without building
    #[arg(long)]
    pub restart_only: bool,
    /// Skip the application's additional servers
    #[arg(long)]
    pub only_this_server: bool,
    /// Show hidden log lines
    #[arg(long)]
    pub show_hidden: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_deploy_flags() {
        let cli = Cli::parse_from([
            "berth",
            "-vv",
            "deploy",
            "--app",
            "shop",
            "--pr",
            "12",
            "--force-rebuild",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, PathBuf::from("berth.toml"));
        let Command::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.app, "shop");
        assert_eq!(args.pr, Some(12));
        assert!(args.force_rebuild);
        assert!(!args.restart_only);
        assert!(args.commit.is_none());
    }

    #[test]
    fn rollback_requires_a_commit() {
        assert!(Cli::try_parse_from(["berth", "rollback", "--app", "shop"]).is_err());
        let cli = Cli::try_parse_from([
            "berth", "-c", "prod.toml", "rollback", "--app", "shop", "--commit", "abc1234",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("prod.toml"));
        assert!(matches!(cli.command, Command::Rollback { commit, .. } if commit == "abc1234"));
    }
}
