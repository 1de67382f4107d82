mod atom;
mod authormap;
mod cvsnumber;
mod diagnostics;
mod emit;
mod gapbuffer;
mod generate;
mod grammar;
mod merge;
mod model;
mod nodehash;
mod pipeline;
mod revcvs;
mod revdir;
mod tags;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

use pipeline::Pipeline;

/// Reads one or more RCS `,v` master files and writes a `git fast-import`
/// stream reconstructing their CVS history as a single gitspace repository.
///
/// Branch and tag history is merged across every master given on the
/// command line; a file's export path is its position on disk relative to
/// the masters given (see `--strip` to drop a common prefix).
#[derive(Debug, clap::Parser)]
#[clap(version, author)]
struct Cli {
    #[clap(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// RCS master files (`,v`) to read.
    #[clap(required = true)]
    masters: Vec<PathBuf>,

    /// Map CVS usernames to `Full Name <email>` identities.
    #[clap(short = 'A', long, value_name = "FILE")]
    authormap: Option<PathBuf>,

    /// Write a CVS-revision-to-git-mark table to this file after export.
    #[clap(short = 'R', long, value_name = "FILE")]
    revision_map: Option<PathBuf>,

    /// Record each blob's originating CVS revision as a commit note.
    #[clap(short = 'r', long)]
    cvs_revision_props: bool,

    /// Use each commit's raw CVS timestamp even when a later repair pass
    /// would otherwise adjust it.
    #[clap(short = 'T', long)]
    force_dates: bool,

    /// Emit refs under `refs/remotes/<NAME>` instead of `refs/heads`.
    #[clap(short = 'e', long, value_name = "NAME")]
    remote: Option<String>,

    /// Drop this many leading path components from every master path
    /// before computing its export directory.
    #[clap(short = 's', long, default_value_t = 0)]
    strip: usize,

    /// Skip commits at or before this point (RFC 3339 timestamp, or a
    /// duration like "3 days ago") — a repeat run only emits new history.
    #[clap(short = 'i', long, value_name = "WHEN")]
    incremental: Option<String>,

    /// Seconds within which same-author, same-log commits across masters
    /// are folded into one changeset.
    #[clap(short = 'w', long, default_value_t = merge::DEFAULT_WINDOW)]
    window: u32,

    /// Log progress (commit counts, elapsed time) at info level.
    #[clap(short = 'p', long)]
    progress: bool,

    /// RCS keyword-expansion mode override: kv, kvl, k, v, o, or b.
    #[clap(short = 'k', long, value_name = "MODE")]
    keyword_expansion: Option<String>,

    /// File listing branch names in the order they should be emitted
    /// (one per line); branches not listed sort after those that are.
    #[clap(short = 'B', long, value_name = "FILE")]
    branchorder: Option<PathBuf>,

    /// Dump each master's per-file commit graph to stdout instead of
    /// emitting a fast-import stream.
    #[clap(short = 'g', long = "graph")]
    dump_dag: bool,
}

fn parse_incremental_cutoff(text: &str) -> Option<model::CvsTime> {
    if let Ok(datetime) = ::time::OffsetDateTime::parse(text, &::time::format_description::well_known::Iso8601::PARSING)
    {
        return Some(datetime.unix_timestamp() as model::CvsTime);
    }
    if let Ok(duration) = humantime::parse_duration(text) {
        let cutoff = std::time::SystemTime::now().checked_sub(duration)?;
        let epoch = cutoff.duration_since(std::time::UNIX_EPOCH).ok()?;
        return Some(epoch.as_secs() as model::CvsTime);
    }
    None
}

fn read_branchorder(path: &PathBuf) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
}

fn branch_sort_key(name: &str, order: &[String]) -> (bool, usize, String) {
    if name == "master" {
        return (false, 0, name.to_string());
    }
    match order.iter().position(|n| n == name) {
        Some(i) => (false, i + 1, name.to_string()),
        None => (true, order.len() + 1, name.to_string()),
    }
}

/// `--revision-map` output: one `master revision mark` line per CVS
/// revision that made it into a gitspace commit, in master file order.
fn write_revision_map(
    path: &std::path::Path,
    masters: &[(std::sync::Arc<model::CvsMaster>, revcvs::PerMasterDag)],
    marks: &emit::Marks,
) -> anyhow::Result<()> {
    use std::io::Write;
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for (master, dag) in masters {
        for head in &dag.heads {
            let mut cursor = head.commit.borrow().clone();
            while let Some(commit) = cursor {
                if let Some(gitspace) = commit.gitspace.borrow().clone() {
                    if let Some(mark) = marks.commit_mark(&gitspace) {
                        writeln!(out, "{} {} :{}", master.master_name.as_str(), commit.number, mark)?;
                    }
                }
                cursor = commit.parent.borrow().clone();
            }
        }
    }
    Ok(())
}

/// `--graph`/`-g`: print each master's per-file commit graph instead of
/// emitting a fast-import stream (the original's `dump_rev_graph`).
fn dump_dag(masters: &[(std::sync::Arc<model::CvsMaster>, revcvs::PerMasterDag)]) {
    for (master, dag) in masters {
        println!("{}:", master.master_name.as_str());
        for head in &dag.heads {
            let name = head.name.borrow().as_ref().map(|n| n.as_str().to_string());
            println!("  branch {}", name.as_deref().unwrap_or("(unnamed)"));
            let mut cursor = head.commit.borrow().clone();
            while let Some(commit) = cursor {
                println!(
                    "    {} {} {}{}",
                    commit.number,
                    commit.date.get(),
                    commit.author.as_str(),
                    if commit.dead { " (dead)" } else { "" }
                );
                cursor = commit.parent.borrow().clone();
            }
        }
    }
}

fn branch_ref(name: &str, remote: Option<&str>) -> String {
    match remote {
        Some(r) => format!("refs/remotes/{r}/{name}"),
        None => format!("refs/heads/{name}"),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).init();

    let authors = match &cli.authormap {
        Some(path) => Some(authormap::parse(path)?),
        None => None,
    };

    let cutoff = match &cli.incremental {
        Some(text) => Some(
            parse_incremental_cutoff(text)
                .with_context(|| format!("'{text}' is not an RFC 3339 date or a duration"))?,
        ),
        None => None,
    };

    let branchorder = match &cli.branchorder {
        Some(path) => read_branchorder(path)?,
        None => Vec::new(),
    };

    let blob_root = std::env::temp_dir().join(format!("cvs-fast-export-{}", std::process::id()));
    let mut pipeline = Pipeline::new(cli.window, blob_root.clone())?;
    pipeline.strip = cli.strip;

    let start = Instant::now();
    let masters = pipeline.analyze_masters(&cli.masters)?;
    if cli.progress {
        log::info!("analysed {} masters in {}ms", masters.len(), start.elapsed().as_millis());
    }

    if cli.dump_dag {
        dump_dag(&masters);
        return Ok(());
    }

    let for_revision_map = cli.revision_map.as_ref().map(|_| masters.clone());

    let start = Instant::now();
    let branches = pipeline.merge(masters)?;
    if cli.progress {
        log::info!("merged {} branches in {}ms", branches.len(), start.elapsed().as_millis());
    }

    let mut names: Vec<atom::Atom> = branches.keys().cloned().collect();
    names.sort_by_key(|n| branch_sort_key(n.as_str(), &branchorder));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut marks = emit::Marks::new();
    let mut buffers = Vec::new();
    for name in &names {
        let branch = &branches[name];
        let Some(head) = branch.commit.borrow().clone() else { continue };
        let mut buf = Vec::new();
        emit::emit_branch(
            &mut buf,
            &pipeline.blobs,
            &mut marks,
            &branch_ref(name.as_str(), cli.remote.as_deref()),
            &head,
            cutoff,
            authors.as_ref(),
            Some(&pipeline.tags),
        )?;
        buffers.push(buf);
    }

    emit::emit_blobs(&mut out, &pipeline.blobs, &marks)?;
    for buf in buffers {
        use std::io::Write;
        out.write_all(&buf)?;
    }
    emit::emit_done(&mut out)?;

    if let (Some(path), Some(masters)) = (&cli.revision_map, for_revision_map) {
        write_revision_map(path, &masters, &marks)?;
    }

    if cli.progress {
        log::info!("{} warnings", pipeline.warnings.count());
    }

    std::fs::remove_dir_all(&blob_root).ok();
    Ok(())
}
