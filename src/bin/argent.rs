//! # Argent CLI
//!
//! Command-line interface for the Argent version control engine.
//!
//! ## Usage
//! ```bash
//! # Start a repository
//! argent init
//!
//! # Track and commit files
//! argent add src/main.rs
//! argent commit -m "initial import"
//!
//! # Inspect and move around
//! argent status
//! argent log
//! argent update <rev>
//!
//! # Merge another head, resolve, continue
//! argent merge <rev>
//! argent resolve --mark src/main.rs
//! argent merge --continue -m "merged"
//! ```
//!
//! Exit codes: 0 on success, 1 on soft failures (nothing changed, no
//! rollback information, unresolved conflicts, no changes found), 255 on
//! abort.

use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};

use argent::dirstate::terse_directories;
use argent::repo::{whoami, Repository};
use argent::sync::LocalPeer;
use argent::types::{BackoutOptions, CommitOptions, Phase};
use argent::{ArgentError, Result};

/// Argent - transactional local version control
#[derive(Parser)]
#[command(name = "argent")]
#[command(version)]
#[command(about = "Transactional, content-addressed version control")]
struct Cli {
    /// Repository path (defaults to current directory)
    #[arg(short = 'R', long, global = true)]
    repository: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new repository
    Init,

    /// Start tracking files
    Add {
        /// Files to track
        files: Vec<String>,
    },

    /// Stop tracking files and delete them
    Remove {
        /// Files to remove
        files: Vec<String>,
    },

    /// Record that dest is a copy of source
    Copy {
        /// Copy source
        source: String,
        /// Copy destination
        dest: String,
    },

    /// Show changed files in the working copy
    #[command(alias = "st")]
    Status {
        /// Also list clean files
        #[arg(short = 'c', long)]
        clean: bool,
        /// Also list ignored files
        #[arg(short = 'i', long)]
        ignored: bool,
        /// Collapse fully-uniform directories
        #[arg(short = 't', long)]
        terse: bool,
    },

    /// Commit the working copy
    #[command(alias = "ci")]
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,
        /// Record this user instead of the default
        #[arg(short, long)]
        user: Option<String>,
        /// Commit onto this named branch
        #[arg(long)]
        branch: Option<String>,
    },

    /// Show revision history
    Log {
        /// Limit the number of revisions shown
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Move the working copy to another revision
    #[command(alias = "up", alias = "checkout")]
    Update {
        /// Target revision
        rev: String,
        /// Discard uncommitted changes
        #[arg(short = 'C', long)]
        clean: bool,
    },

    /// Merge another revision into the working copy
    Merge {
        /// Revision to merge
        rev: Option<String>,
        /// Commit a fully resolved merge
        #[arg(long = "continue", conflicts_with = "abort_merge")]
        continue_merge: bool,
        /// Abandon the pending merge
        #[arg(long = "abort")]
        abort_merge: bool,
        /// Message for --continue
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List or mark merge conflicts
    Resolve {
        /// Files to mark
        files: Vec<String>,
        /// List resolution state of all files
        #[arg(short, long)]
        list: bool,
        /// Mark files resolved
        #[arg(short, long, conflicts_with = "unmark")]
        mark: bool,
        /// Mark files unresolved again
        #[arg(short, long)]
        unmark: bool,
    },

    /// Reverse-apply a changeset
    Backout {
        /// Changeset to back out
        rev: String,
        /// Parent to back out towards (for merge changesets)
        #[arg(long)]
        parent: Option<String>,
        /// Merge the backout with the working copy
        #[arg(long)]
        merge: bool,
        /// Leave the reversal uncommitted
        #[arg(long)]
        no_commit: bool,
        /// Commit message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Undo the last committed transaction
    Rollback,

    /// Show repository heads
    Heads {
        /// Restrict to one branch
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// List, set, or delete bookmarks
    Bookmark {
        /// Bookmark name
        name: Option<String>,
        /// Revision to point the bookmark at
        #[arg(short, long)]
        rev: Option<String>,
        /// Delete the bookmark
        #[arg(short, long)]
        delete: bool,
    },

    /// Show or change the active branch name
    Branch {
        /// New branch name for the next commit
        name: Option<String>,
    },

    /// Show or set the phase of revisions
    Phase {
        /// Revisions to inspect or move
        revs: Vec<String>,
        /// Move to public
        #[arg(short, long, conflicts_with_all = ["draft", "secret"])]
        public: bool,
        /// Move to draft
        #[arg(short, long, conflicts_with = "secret")]
        draft: bool,
        /// Move to secret
        #[arg(short, long)]
        secret: bool,
        /// Allow moving a public changeset backwards
        #[arg(short, long)]
        force: bool,
    },

    /// Check repository integrity
    Verify {
        /// Rebuild repairable structures
        #[arg(long)]
        repair: bool,
    },

    /// Pull changesets from another repository
    Pull {
        /// Source repository path
        source: PathBuf,
        /// Pull only these revisions
        #[arg(short, long)]
        rev: Vec<String>,
    },

    /// Push changesets to another repository
    Push {
        /// Destination repository path
        dest: PathBuf,
        /// Allow creating new remote heads
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(err) = run(cli) {
        eprintln!("{}", err);
        std::process::exit(err.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.repository.unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Init => {
            Repository::init(&root)?;
            println!("initialized repository at {}", root.display());
            Ok(())
        }
        Commands::Add { files } => Repository::open(&root)?.add(&files),
        Commands::Remove { files } => Repository::open(&root)?.remove(&files),
        Commands::Copy { source, dest } => Repository::open(&root)?.copy(&source, &dest),
        Commands::Status {
            clean,
            ignored,
            terse,
        } => cmd_status(&root, clean, ignored, terse),
        Commands::Commit {
            message,
            user,
            branch,
        } => cmd_commit(&root, message, user, branch),
        Commands::Log { limit } => cmd_log(&root, limit),
        Commands::Update { rev, clean } => cmd_update(&root, &rev, clean),
        Commands::Merge {
            rev,
            continue_merge,
            abort_merge,
            message,
        } => cmd_merge(&root, rev, continue_merge, abort_merge, message),
        Commands::Resolve {
            files,
            list,
            mark,
            unmark,
        } => cmd_resolve(&root, files, list, mark, unmark),
        Commands::Backout {
            rev,
            parent,
            merge,
            no_commit,
            message,
        } => cmd_backout(&root, &rev, parent, merge, no_commit, message),
        Commands::Rollback => cmd_rollback(&root),
        Commands::Heads { branch } => cmd_heads(&root, branch.as_deref()),
        Commands::Bookmark { name, rev, delete } => cmd_bookmark(&root, name, rev, delete),
        Commands::Branch { name } => cmd_branch(&root, name),
        Commands::Phase {
            revs,
            public,
            draft,
            secret,
            force,
        } => cmd_phase(&root, revs, public, draft, secret, force),
        Commands::Verify { repair } => cmd_verify(&root, repair),
        Commands::Pull { source, rev } => cmd_pull(&root, &source, rev),
        Commands::Push { dest, force } => cmd_push(&root, &dest, force),
    }
}

fn cmd_status(root: &Path, clean: bool, ignored: bool, terse: bool) -> Result<()> {
    let repo = Repository::open(root)?;
    let mut status = repo.status(clean, ignored)?;
    if terse {
        let mut requested = String::from("mardu");
        if clean {
            requested.push('c');
        }
        if ignored {
            requested.push('i');
        }
        status = terse_directories(&status, &requested);
    }

    for path in &status.modified {
        println!("{} {}", "M".cyan().bold(), path);
    }
    for path in &status.added {
        println!("{} {}", "A".green().bold(), path);
    }
    for path in &status.removed {
        println!("{} {}", "R".red().bold(), path);
    }
    for path in &status.deleted {
        println!("{} {}", "!".red().bold(), path);
    }
    for path in &status.unknown {
        println!("{} {}", "?".magenta(), path);
    }
    for path in &status.ignored {
        println!("{} {}", "I".dimmed(), path);
    }
    for path in &status.clean {
        println!("{} {}", "C".dimmed(), path);
    }
    Ok(())
}

fn cmd_commit(
    root: &Path,
    message: String,
    user: Option<String>,
    branch: Option<String>,
) -> Result<()> {
    let mut repo = Repository::open(root)?;
    let mut options = CommitOptions::new(message, user.unwrap_or_else(whoami));
    options.branch = branch;
    let id = repo.commit(&options)?;
    println!("committed {}", short(&id).yellow());
    Ok(())
}

fn cmd_log(root: &Path, limit: Option<usize>) -> Result<()> {
    let repo = Repository::open(root)?;
    let limit = limit.unwrap_or(usize::MAX);
    for changeset in repo.log().into_iter().take(limit) {
        println!(
            "{}  {}  {}  {}",
            short(&changeset.id).yellow(),
            changeset.branch.green(),
            changeset.user.dimmed(),
            changeset.summary_line()
        );
    }
    Ok(())
}

fn cmd_update(root: &Path, rev: &str, clean: bool) -> Result<()> {
    let mut repo = Repository::open(root)?;
    let stats = repo.update(rev, clean)?;
    println!(
        "{} files updated, {} files merged, {} files removed, {} files unresolved",
        stats.updated, stats.merged, stats.removed, stats.unresolved
    );
    Ok(())
}

fn cmd_merge(
    root: &Path,
    rev: Option<String>,
    continue_merge: bool,
    abort_merge: bool,
    message: Option<String>,
) -> Result<()> {
    let mut repo = Repository::open(root)?;
    if continue_merge {
        let message = message.unwrap_or_else(|| "merge".to_string());
        let id = repo.merge_continue(&CommitOptions::new(message, whoami()))?;
        println!("committed merge {}", short(&id).yellow());
        return Ok(());
    }
    if abort_merge {
        repo.merge_abort()?;
        println!("merge aborted, working copy restored");
        return Ok(());
    }
    let rev = rev.ok_or_else(|| ArgentError::abort("merge requires a revision"))?;
    let stats = repo.merge(&rev)?;
    println!(
        "{} files updated, {} files merged, {} files removed, {} files unresolved",
        stats.updated, stats.merged, stats.removed, stats.unresolved
    );
    if stats.unresolved > 0 {
        println!("use 'argent resolve' to retry unresolved file merges");
        return Err(ArgentError::UnresolvedConflicts);
    }
    Ok(())
}

fn cmd_resolve(
    root: &Path,
    files: Vec<String>,
    list: bool,
    mark: bool,
    unmark: bool,
) -> Result<()> {
    let mut repo = Repository::open(root)?;
    if list || (!mark && !unmark) {
        for (path, state) in repo.resolve_list()? {
            let tag = match state {
                argent::merge::ResolutionState::Unresolved => "U".red().bold(),
                argent::merge::ResolutionState::Resolved => "R".green().bold(),
                argent::merge::ResolutionState::ResolvedByTool => "R".green(),
            };
            println!("{} {}", tag, path);
        }
        return Ok(());
    }
    if files.is_empty() {
        return Err(ArgentError::abort("resolve: no files given"));
    }
    for path in &files {
        repo.resolve_mark(path, mark)?;
    }
    Ok(())
}

fn cmd_backout(
    root: &Path,
    rev: &str,
    parent: Option<String>,
    merge: bool,
    no_commit: bool,
    message: Option<String>,
) -> Result<()> {
    let mut repo = Repository::open(root)?;
    let options = BackoutOptions {
        parent,
        merge,
        no_commit,
        message,
    };
    match repo.backout(rev, &options)? {
        Some(id) => println!("changeset {} backs out {}", short(&id).yellow(), short(rev)),
        None => println!("changeset {} backed out, changes left uncommitted", short(rev)),
    }
    Ok(())
}

fn cmd_rollback(root: &Path) -> Result<()> {
    let mut repo = Repository::open(root)?;
    let operation = repo.rollback()?;
    println!("rolled back {}", operation);
    Ok(())
}

fn cmd_heads(root: &Path, branch: Option<&str>) -> Result<()> {
    let repo = Repository::open(root)?;
    for id in repo.heads(branch)? {
        let changeset = repo.graph().get(&id)?;
        println!(
            "{}  {}  {}",
            short(&id).yellow(),
            changeset.branch.green(),
            changeset.summary_line()
        );
    }
    Ok(())
}

fn cmd_bookmark(
    root: &Path,
    name: Option<String>,
    rev: Option<String>,
    delete: bool,
) -> Result<()> {
    let mut repo = Repository::open(root)?;
    match name {
        None => {
            for (name, id, active) in repo.bookmarks() {
                let marker = if active { "*" } else { " " };
                println!("{} {}  {}", marker.cyan().bold(), name, short(&id).yellow());
            }
            Ok(())
        }
        Some(name) if delete => repo.bookmark_delete(&name),
        Some(name) => repo.bookmark_set(&name, rev.as_deref()),
    }
}

fn cmd_branch(root: &Path, name: Option<String>) -> Result<()> {
    let mut repo = Repository::open(root)?;
    match name {
        None => {
            println!("{}", repo.branch().green());
            Ok(())
        }
        Some(name) => {
            repo.set_branch(&name)?;
            println!("marked working directory as branch {}", name.green());
            Ok(())
        }
    }
}

fn cmd_phase(
    root: &Path,
    revs: Vec<String>,
    public: bool,
    draft: bool,
    secret: bool,
    force: bool,
) -> Result<()> {
    let mut repo = Repository::open(root)?;
    let target = if public {
        Some(Phase::Public)
    } else if draft {
        Some(Phase::Draft)
    } else if secret {
        Some(Phase::Secret)
    } else {
        None
    };
    let revs = if revs.is_empty() {
        vec![".".to_string()]
    } else {
        revs
    };
    for rev in &revs {
        match target {
            Some(phase) => repo.set_phase(rev, phase, force)?,
            None => {
                let phase = repo.phase(rev)?;
                let id = repo.resolve(rev)?;
                println!("{}: {}", short(&id).yellow(), phase.name());
            }
        }
    }
    Ok(())
}

fn cmd_verify(root: &Path, repair: bool) -> Result<()> {
    let mut repo = Repository::open(root)?;
    let report = repo.verify(repair)?;
    for warning in &report.warnings {
        println!("{}: {}", "warning".yellow(), warning);
    }
    for error in &report.errors {
        println!("{}: {}", "error".red().bold(), error);
    }
    println!(
        "checked {} changesets, {} manifests, {} file revisions",
        report.changesets, report.manifests, report.files
    );
    if report.repaired > 0 {
        println!("repaired {} entries", report.repaired);
    }
    if !report.is_clean() {
        return Err(ArgentError::corruption(format!(
            "{} integrity errors",
            report.errors.len()
        )));
    }
    Ok(())
}

fn cmd_pull(root: &Path, source: &Path, rev: Vec<String>) -> Result<()> {
    let mut repo = Repository::open(root)?;
    let peer = LocalPeer::open(source.to_path_buf())?;
    let revs = if rev.is_empty() { None } else { Some(rev.as_slice()) };
    let report = repo.pull(&peer, revs)?;
    for warning in &report.warnings {
        println!("{}: {}", "warning".yellow(), warning);
    }
    println!("added {} changesets", report.added);
    Ok(())
}

fn cmd_push(root: &Path, dest: &Path, force: bool) -> Result<()> {
    let mut repo = Repository::open(root)?;
    let mut peer = LocalPeer::open(dest.to_path_buf())?;
    let pushed = repo.push(&mut peer, force)?;
    println!("pushed {} changesets", pushed);
    Ok(())
}

fn short(id: &str) -> &str {
    &id[..12.min(id.len())]
}
