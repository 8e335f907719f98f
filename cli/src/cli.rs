use clap::Parser;
use clap::ValueEnum;
use rlm_core::Profile;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Run one recursive session against a pre-built repository index."
)]
pub struct Cli {
    /// Pre-built repository index: a JSON snapshot of files, symbols, and
    /// edges. Building indices is the index layer's job, not this tool's.
    #[arg(long = "repo-index", value_name = "FILE")]
    pub repo_index: PathBuf,

    /// Scripted model replies as JSONL, one completion per line, consumed
    /// in order. Production hosts embed rlm-core with a live transport.
    #[arg(long = "replies", value_name = "FILE")]
    pub replies: PathBuf,

    /// Model the session should use (subject to the policy profile).
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Policy profile for this run.
    #[arg(long, value_enum)]
    pub profile: Option<ProfileArg>,

    /// Inject a context blob, NAME=FILE. May be repeated.
    #[arg(long = "context", value_name = "NAME=FILE")]
    pub context: Vec<String>,

    /// Append the governance trace to this JSONL file.
    #[arg(long = "trace", value_name = "FILE")]
    pub trace: Option<PathBuf>,

    /// Override the turn cap for this run.
    #[arg(long = "max-turns")]
    pub max_turns: Option<u32>,

    /// Override the sub-session depth cap for this run.
    #[arg(long = "max-depth")]
    pub max_depth: Option<u32>,

    /// Print the full session result as JSON instead of just the answer.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// The task to answer.
    pub task: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ProfileArg {
    Open,
    Restricted,
}

impl From<ProfileArg> for Profile {
    fn from(value: ProfileArg) -> Self {
        match value {
            ProfileArg::Open => Profile::Open,
            ProfileArg::Restricted => Profile::Restricted,
        }
    }
}
