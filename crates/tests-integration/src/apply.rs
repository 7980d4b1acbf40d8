use std::os::unix::fs::PermissionsExt;

use anyhow::{ensure, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use indoc::indoc;
use libtest_mimic::Trial;
use xshell::{cmd, Shell};

/// Stands in for the overlay tool: records the stack it was asked for
/// inside the mounted root, and fails for the stack named "fail".
const COLLABORATOR: &str = indoc! { r#"
    #!/bin/sh
    set -eu
    [ "$1" = apply ] || exit 0
    shift
    stack=
    while [ $# -gt 0 ]; do
        case "$1" in
            --mount-point) mnt=$2; shift 2 ;;
            --stack) stack=$2; shift 2 ;;
            *) shift ;;
        esac
    done
    [ "$stack" != fail ] || exit 1
    # The pseudo filesystems must be in place
    [ -e "$mnt/proc/self/mountinfo" ] || exit 2
    [ -e "$mnt/dev/null" ] || exit 2
    mkdir -p "$mnt/etc"
    echo "$stack" > "$mnt/etc/rootpatch-test"
    if mountpoint -q "$mnt/boot/efi"; then
        echo "$stack" > "$mnt/etc/rootpatch-efi"
    fi
"# };

const SPARSE_MAGIC: [u8; 4] = [0x3a, 0xff, 0x26, 0xed];
const MIB: u64 = 1024 * 1024;
/// Free space a re-encoded image keeps, as configured below.
const SPARSE_SLACK: u64 = 256 * MIB;

struct Fixture {
    _td: tempfile::TempDir,
    dir: Utf8PathBuf,
    config: Utf8PathBuf,
    overlays: Utf8PathBuf,
    mnt: Utf8PathBuf,
}

impl Fixture {
    #[context("Creating fixture")]
    fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path())
            .context("Non-UTF8 tempdir")?
            .to_owned();
        let overlays = dir.join("overlays");
        std::fs::create_dir(&overlays)?;
        let collaborator = dir.join("overlay-apply");
        std::fs::write(&collaborator, COLLABORATOR)?;
        std::fs::set_permissions(&collaborator, std::fs::Permissions::from_mode(0o755))?;
        let config = dir.join("config.toml");
        std::fs::write(
            &config,
            format!("collaborator = [\"{collaborator}\"]\nsparse-slack = \"256M\"\n"),
        )?;
        let mnt = dir.join("mnt");
        Ok(Self {
            _td: td,
            dir,
            config,
            overlays,
            mnt,
        })
    }

    fn ext4(&self, sh: &Shell, name: &str, size: &str) -> Result<Utf8PathBuf> {
        let img = self.dir.join(name);
        cmd!(sh, "truncate -s {size} {img}").run()?;
        cmd!(sh, "mkfs.ext4 -q -F {img}").run()?;
        Ok(img)
    }

    /// An ext4 image populated from `contents`, as (path, data) pairs.
    fn ext4_with(
        &self,
        sh: &Shell,
        name: &str,
        size: &str,
        contents: &[(&str, &str)],
    ) -> Result<Utf8PathBuf> {
        let seed = self.dir.join(format!("{name}.d"));
        for (path, data) in contents {
            let p = seed.join(path);
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&p, data)?;
        }
        let img = self.dir.join(name);
        cmd!(sh, "truncate -s {size} {img}").run()?;
        cmd!(sh, "mkfs.ext4 -q -F -d {seed} {img}").run()?;
        Ok(img)
    }

    fn apply(
        &self,
        sh: &Shell,
        bin: &str,
        image: &Utf8Path,
        stack: &str,
        extra: &[&str],
    ) -> Result<()> {
        let Fixture {
            config,
            overlays,
            mnt,
            ..
        } = self;
        cmd!(
            sh,
            "{bin} --config {config} apply --image {image} --stack {stack} --overlay-dirs {overlays} --mount-point {mnt} {extra...}"
        )
        .run()?;
        Ok(())
    }

    /// Nothing may stay attached or mounted after an apply, whatever its outcome.
    #[context("Checking for leftover resources")]
    fn assert_released(&self, sh: &Shell, images: &[&Utf8Path]) -> Result<()> {
        for image in images {
            let loops = cmd!(sh, "losetup -j {image}").read()?;
            ensure!(loops.trim().is_empty(), "Loop devices left attached: {loops}");
        }
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        let stale: Vec<_> = mountinfo
            .lines()
            .filter(|l| l.contains(self.mnt.as_str()))
            .collect();
        ensure!(stale.is_empty(), "Mounts left behind: {stale:?}");
        Ok(())
    }
}

/// Read a file out of an unmounted ext4 image.
fn read_ext4(sh: &Shell, image: &Utf8Path, path: &str) -> Result<String> {
    let req = format!("cat {path}");
    let r = cmd!(sh, "debugfs -R {req} {image}").ignore_stderr().read()?;
    Ok(r)
}

fn is_sparse(image: &Utf8Path) -> Result<bool> {
    let buf = std::fs::read(image)?;
    Ok(buf.starts_with(&SPARSE_MAGIC))
}

fn plain(bin: &str) -> Result<()> {
    let sh = &Shell::new()?;
    let fx = Fixture::new()?;
    let img = fx.ext4(sh, "rootfs.img", "100M")?;
    fx.apply(sh, bin, &img, "base", &[])?;
    fx.assert_released(sh, &[&img])?;
    ensure!(read_ext4(sh, &img, "/etc/rootpatch-test")?.trim() == "base");
    Ok(())
}

fn plain_with_efi(bin: &str) -> Result<()> {
    let sh = &Shell::new()?;
    let fx = Fixture::new()?;
    let img = fx.ext4(sh, "rootfs.img", "64M")?;
    let efi = fx.dir.join("efi.img");
    cmd!(sh, "mkfs.vfat -C {efi} 32768").run()?;
    fx.apply(sh, bin, &img, "base", &["--efi-image", efi.as_str()])?;
    fx.assert_released(sh, &[&img, &efi])?;
    ensure!(read_ext4(sh, &img, "/etc/rootpatch-test")?.trim() == "base");
    ensure!(read_ext4(sh, &img, "/etc/rootpatch-efi")?.trim() == "base");
    let container = fx.dir.join("rootfs.img.container");
    ensure!(!container.exists(), "{container} was not removed");
    Ok(())
}

fn sparse(bin: &str) -> Result<()> {
    let sh = &Shell::new()?;
    let fx = Fixture::new()?;
    let payload = "x".repeat(3 * 1024 * 1024);
    let contents = [("etc/hostname", "device\n"), ("vendor/blob", payload.as_str())];
    let raw = fx.ext4_with(sh, "source.img", "64M", &contents)?;
    let img = fx.dir.join("system.img");
    cmd!(sh, "img2simg {raw} {img}").run()?;
    ensure!(is_sparse(&img)?);
    fx.apply(sh, bin, &img, "base", &[])?;
    fx.assert_released(sh, &[&img])?;
    ensure!(is_sparse(&img)?, "Output is no longer sparse");
    ensure!(!fx.dir.join("system.img.raw").exists());

    // Decodes to a clean filesystem of bounded size
    let check = fx.dir.join("check.img");
    cmd!(sh, "simg2img {img} {check}").run()?;
    cmd!(sh, "e2fsck -f -n {check}").run()?;
    let size = std::fs::metadata(&check)?.len();
    // The minimum can't exceed the 64M the filesystem started at
    let bound = 64 * MIB + SPARSE_SLACK + 4096;
    ensure!(
        (SPARSE_SLACK..=bound).contains(&size),
        "Decoded size {size} outside {SPARSE_SLACK}..={bound}"
    );

    // Original contents survive next to the change
    ensure!(read_ext4(sh, &check, "/etc/rootpatch-test")?.trim() == "base");
    ensure!(read_ext4(sh, &check, "/etc/hostname")?.trim() == "device");
    ensure!(read_ext4(sh, &check, "/vendor/blob")? == payload, "/vendor/blob differs");
    Ok(())
}

fn disk_root_only(bin: &str) -> Result<()> {
    let sh = &Shell::new()?;
    let fx = Fixture::new()?;
    let disk = fx.dir.join("disk.img");
    cmd!(sh, "truncate -s 128M {disk}").run()?;
    let script = indoc! { "
        label: gpt
        start=2048, size=131072, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4, name=root
    " };
    cmd!(sh, "sfdisk -q {disk}").stdin(script).run()?;
    cmd!(sh, "mkfs.ext4 -q -F -E offset=1048576 {disk} 64M").run()?;
    fx.apply(sh, bin, &disk, "base", &[])?;
    fx.assert_released(sh, &[&disk])?;
    let part = fx.dir.join("part.img");
    let (input, output) = (format!("if={disk}"), format!("of={part}"));
    cmd!(sh, "dd {input} {output} bs=512 skip=2048 count=131072 status=none").run()?;
    ensure!(read_ext4(sh, &part, "/etc/rootpatch-test")?.trim() == "base");
    Ok(())
}

fn collaborator_failure(bin: &str) -> Result<()> {
    let sh = &Shell::new()?;
    let fx = Fixture::new()?;
    let img = fx.ext4(sh, "rootfs.img", "64M")?;
    let r = fx.apply(sh, bin, &img, "fail", &[]);
    ensure!(r.is_err(), "Apply of a failing stack succeeded");
    fx.assert_released(sh, &[&img])?;
    ensure!(read_ext4(sh, &img, "/etc/rootpatch-test")?.trim().is_empty());

    // Same for a sparse image, which must be left exactly as it was
    let src = fx.ext4(sh, "source.img", "64M")?;
    let simg = fx.dir.join("system.img");
    cmd!(sh, "img2simg {src} {simg}").run()?;
    let before = std::fs::read(&simg)?;
    ensure!(fx.apply(sh, bin, &simg, "fail", &[]).is_err());
    fx.assert_released(sh, &[&simg])?;
    ensure!(std::fs::read(&simg)? == before, "Sparse image was modified");
    ensure!(!fx.dir.join("system.img.raw").exists());
    Ok(())
}

#[context("Apply tests")]
pub(crate) fn run(bin: &Utf8Path, testargs: libtest_mimic::Arguments) -> Result<()> {
    // Trials need a static reference
    let bin: &'static str = String::from(bin.as_str()).leak();
    let unprivileged = !rustix::process::getuid().is_root();

    let scenarios: [(&str, fn(&str) -> Result<()>); 5] = [
        ("plain image", plain),
        ("plain image with efi image", plain_with_efi),
        ("sparse image", sparse),
        ("disk image with only a root partition", disk_root_only),
        ("failing overlay leaves nothing behind", collaborator_failure),
    ];
    let tests: Vec<Trial> = scenarios
        .into_iter()
        .map(|(name, f)| {
            Trial::test(name, move || f(bin).map_err(|e| format!("{e:?}").into()))
                .with_ignored_flag(unprivileged)
        })
        .collect();

    libtest_mimic::run(&testargs, tests).exit()
}
