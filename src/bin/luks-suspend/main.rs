#![deny(bare_trait_objects)]

use std::process::exit;

use clap::Parser;

use luks_suspend::cli::GlobalOpts;
use luks_suspend::outer;

#[derive(Parser, Debug)]
#[command(author, about = "Suspend to RAM, freezing LUKS1 master keys and re-prompting for them on resume", version)]
struct Opts {
    #[command(flatten)]
    global: GlobalOpts,
}

fn run_luks_suspend() -> i32 {
    env_logger::init();

    let opts = Opts::parse();
    let policy = opts.global.to_policy();

    match outer::run_outer(&policy) {
        Ok(()) => 0,
        Err(e) => {
            if policy.assert(e) {
                0
            } else {
                policy.fail_hard();
            }
        }
    }
}

fn main() {
    exit(run_luks_suspend());
}
