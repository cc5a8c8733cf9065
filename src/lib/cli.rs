//! Command-line flags shared by the `luks-suspend` and `initramfs-suspend` binaries.

use clap::Args;

use crate::policy::Policy;

#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    #[arg(long, long_help = "Enable verbose logging and drop to a rescue shell on otherwise-fatal errors")]
    pub debug: bool,
    #[arg(long, long_help = "Power off the system if the root device cannot be unlocked")]
    pub poweroff: bool,
}

impl GlobalOpts {
    pub fn to_policy(&self) -> Policy {
        Policy::new(self.debug, self.poweroff)
    }
}
