//! Integration tests.

use camino::Utf8PathBuf;
use clap::Parser;

mod apply;

#[derive(Debug, Parser)]
#[clap(name = "rootpatch-integration-tests", version, rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Apply scenarios against real images; needs root, loop devices,
    /// e2fsprogs, dosfstools, sfdisk and the android sparse tools.
    Apply {
        /// Path to the rootpatch binary
        #[clap(long, default_value = "rootpatch")]
        bin: Utf8PathBuf,

        #[clap(flatten)]
        testargs: libtest_mimic::Arguments,
    },
}

fn main() {
    let opt = Opt::parse();
    let r = match opt {
        Opt::Apply { bin, testargs } => apply::run(&bin, testargs),
    };
    if let Err(e) = r {
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }
}
