use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ori::errors::Error;
use ori::hash::ObjectHash;
use ori::remote;
use ori::repo::Repository;
use ori::server;

#[derive(Parser, Debug)]
#[command(name = "ori", version, about = "A content-addressed distributed version control file system")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty repository in the current directory
    Init,
    /// Commit outstanding changes
    Commit {
        /// Commit message
        message: Option<String>,
    },
    /// Show working-directory changes against the head commit
    Status,
    /// Show commit history
    Log,
    /// Three-way merge another commit into the working directory
    Merge {
        /// Commit hash to merge
        commit: String,
    },
    /// Replicate missing objects from a remote and advance the head
    Pull {
        /// `host:path` for ssh, or a local repository path
        remote: String,
    },
    /// Serve the replication protocol on stdin/stdout (launched by ssh)
    Sshserver {
        /// Repository path
        repo: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Init => cmd_init(),
        Command::Commit { message } => cmd_commit(message),
        Command::Status => cmd_status(),
        Command::Log => cmd_log(),
        Command::Merge { commit } => cmd_merge(&commit),
        Command::Pull { remote } => cmd_pull(&remote),
        Command::Sshserver { repo } => Ok(cmd_sshserver(&repo)),
    }
}

fn open_repo() -> Result<Repository> {
    let cwd = std::env::current_dir()?;
    Ok(Repository::find(&cwd)?)
}

fn cmd_init() -> Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    let repo = Repository::init(&cwd)?;
    println!("Initialized repository {}", repo.id()?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_commit(message: Option<String>) -> Result<ExitCode> {
    let repo = open_repo()?;
    let message = message.unwrap_or_else(|| "No message.".to_string());

    match repo.commit(&message)? {
        Some(hash) => println!("Committed {hash}"),
        None => println!("Nothing to commit!"),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_status() -> Result<ExitCode> {
    let repo = open_repo()?;
    for change in repo.status()?.iter() {
        println!("{}   {}", change.tag(), change.path());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_log() -> Result<ExitCode> {
    let repo = open_repo()?;
    for (hash, commit) in repo.history()? {
        let date = chrono::DateTime::from_timestamp(commit.time as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| commit.time.to_string());

        println!("commit {hash}");
        if commit.is_merge() {
            println!(
                "Merge:  {} {}",
                commit.parent1.short(),
                commit.parent2.short()
            );
        }
        println!("Author: {}", commit.author);
        println!("Date:   {date}");
        println!();
        for line in commit.message.lines() {
            println!("    {line}");
        }
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_merge(commit: &str) -> Result<ExitCode> {
    let repo = open_repo()?;
    let theirs = ObjectHash::from_hex(commit)?;

    let outcome = repo.merge(theirs)?;
    for change in outcome.merged.iter() {
        println!("{}   {}", change.tag(), change.path());
    }

    if outcome.has_conflicts() {
        for conflict in &outcome.conflicts {
            println!("C   {}", conflict.path);
        }
        println!(
            "{} conflict(s); resolve them, then run `ori commit`",
            outcome.conflicts.len()
        );
    } else {
        println!("Merged cleanly; run `ori commit` to conclude the merge");
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_pull(remote: &str) -> Result<ExitCode> {
    let repo = open_repo()?;
    let mut source = remote::connect(remote)?;

    let stats = repo.pull(source.as_mut())?;
    repo.checkout_head()?;

    println!("Pulled {} object(s); head is {}", stats.fetched, stats.head);
    Ok(ExitCode::SUCCESS)
}

/// Exit codes are part of the remote-shell contract: 101 when the repository
/// is missing, 1 on lock or protocol failure.
fn cmd_sshserver(path: &std::path::Path) -> ExitCode {
    let repo = match Repository::open(path) {
        Ok(repo) => repo,
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            eprintln!("error: no repository at {}", path.display());
            return ExitCode::from(101);
        }
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    match server::serve(&repo, stdin, stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
