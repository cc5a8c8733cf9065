#![deny(bare_trait_objects)]

use std::process::exit;

use clap::Parser;

use luks_suspend::cli::GlobalOpts;

#[derive(Parser, Debug)]
#[command(author, about = "Initramfs-side counterpart to luks-suspend, run chrooted with the device inventory on fd 3", version)]
struct Opts {
    #[command(flatten)]
    global: GlobalOpts,
}

fn run_initramfs_suspend() -> i32 {
    env_logger::init();

    let opts = Opts::parse();
    let policy = opts.global.to_policy();

    match luks_suspend::run_inner(&policy) {
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
    exit(run_initramfs_suspend());
}
