//! Driving a single apply: validate, pick a flow, acquire resources,
//! run the overlay tool, and tear everything down again whatever happened.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::container::TemporaryContainer;
use crate::error::{ApplyError, TeardownWarning};
use crate::flow::{DebugMode, Flow, MountFlow};
use crate::format;
use crate::host::{AttachOptions, Host, LinuxHost, LoopDevice, MountOps};
use crate::interrupt::Interrupt;
use crate::overlay::{DebugShell, OverlayInvocation, OverlayTarget};
use crate::partitions::{Locator, Slots};
use crate::session::MountSession;
use crate::sparse::SparseCodec;

/// Everything the operator asked for.
#[derive(Debug, Clone)]
pub(crate) struct ApplyRequest {
    pub(crate) image: Utf8PathBuf,
    pub(crate) efi_image: Option<Utf8PathBuf>,
    pub(crate) target: OverlayTarget,
    pub(crate) resources: Option<Utf8PathBuf>,
    pub(crate) overlay_dirs: Vec<Utf8PathBuf>,
    pub(crate) debug: DebugMode,
    /// A temporary directory is used if unset.
    pub(crate) mount_point: Option<Utf8PathBuf>,
}

/// Attached loop devices, detached in reverse order.
#[derive(Debug)]
struct LoopStack<D: LoopDevice>(Vec<D>);

impl<D: LoopDevice> LoopStack<D> {
    fn push(&mut self, dev: D) -> &mut D {
        self.0.push(dev);
        let last = self.0.len() - 1;
        &mut self.0[last]
    }

    fn release(&mut self) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();
        while let Some(dev) = self.0.pop() {
            let resource = dev.path().to_string();
            if let Err(error) = dev.close() {
                let w = TeardownWarning { resource, error };
                tracing::warn!("{w}");
                warnings.push(w);
            }
        }
        warnings
    }
}

impl<D: LoopDevice> Drop for LoopStack<D> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn invalid_args(msg: String) -> anyhow::Error {
    ApplyError::InvalidArguments(msg).into()
}

/// Remove an intermediate file we created; it not existing is fine.
fn remove_intermediate(path: &Utf8Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed {path}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Removing {path}: {e}"),
    }
}

#[derive(Debug)]
pub(crate) struct Applier<'a, H: Host> {
    host: &'a H,
    config: &'a Config,
    interrupt: &'a Interrupt,
}

impl<'a, H: Host> Applier<'a, H> {
    pub(crate) fn new(host: &'a H, config: &'a Config, interrupt: &'a Interrupt) -> Self {
        Self {
            host,
            config,
            interrupt,
        }
    }

    /// Where intermediates for `image` go.
    fn intermediate(&self, image: &Utf8Path, suffix: &str) -> Utf8PathBuf {
        let dir = match self.config.work_dir.as_deref() {
            Some(d) => d,
            None => image.parent().unwrap_or(Utf8Path::new(".")),
        };
        let name = image.file_name().unwrap_or("image");
        dir.join(format!("{name}.{suffix}"))
    }

    /// Checks that need no system resources.
    fn validate(&self, req: &ApplyRequest) -> Result<()> {
        for d in &req.overlay_dirs {
            if !d.is_dir() {
                return Err(invalid_args(format!("overlay directory {d} does not exist")));
            }
        }
        if let Some(r) = req.resources.as_deref() {
            if !r.exists() {
                return Err(invalid_args(format!("resources {r} do not exist")));
            }
        }
        if let Some(efi) = req.efi_image.as_deref() {
            let meta = std::fs::metadata(efi)
                .map_err(|e| ApplyError::invalid_image(efi, format!("cannot stat: {e}")))?;
            if !meta.is_file() || meta.len() == 0 {
                return Err(ApplyError::invalid_image(efi, "not a non-empty regular file").into());
            }
        }
        if let Some(mnt) = req.mount_point.as_deref() {
            if mnt.exists() && !mnt.is_dir() {
                return Err(invalid_args(format!("mount point {mnt} is not a directory")));
            }
            if mnt.exists() {
                // The mount table only knows resolved paths
                let resolved = mnt
                    .canonicalize_utf8()
                    .with_context(|| format!("Resolving {mnt}"))?;
                let mounts = self.host.mounts_under(&resolved)?;
                if mounts.iter().any(|m| m.as_path() == resolved) {
                    return Err(invalid_args(format!("{mnt} is already a mount point")));
                }
            }
        }
        Ok(())
    }

    /// Intermediates must not exist: a leftover raw image may be the only
    /// copy of an earlier run's work.
    fn check_intermediates(&self, image: &Utf8Path, flow: &Flow) -> Result<()> {
        let mut paths = Vec::new();
        let mut root = image.to_owned();
        if flow.sparse {
            root = self.intermediate(image, "raw");
            paths.push(root.clone());
        }
        if flow.mount == MountFlow::PlainWithEfi {
            paths.push(self.intermediate(&root, "container"));
        }
        for p in paths {
            if p.exists() {
                return Err(invalid_args(format!(
                    "{p} exists, left over from an earlier run; recover or remove it"
                )));
            }
        }
        Ok(())
    }

    /// The directory to mount on, absolute and free of symlinks, and
    /// whether we created it.
    fn mount_point(&self, req: &ApplyRequest) -> Result<(Utf8PathBuf, bool)> {
        if let Some(mnt) = req.mount_point.as_deref() {
            std::fs::create_dir_all(mnt).with_context(|| format!("Creating {mnt}"))?;
            let resolved = mnt
                .canonicalize_utf8()
                .with_context(|| format!("Resolving {mnt}"))?;
            return Ok((resolved, false));
        }
        let base = match self.config.work_dir.as_deref() {
            Some(d) => d.as_std_path().to_owned(),
            None => std::env::temp_dir(),
        };
        let dir = tempfile::Builder::new()
            .prefix("rootpatch-")
            .tempdir_in(base)
            .context("Creating temporary mount point")?
            .keep();
        let dir = Utf8PathBuf::try_from(dir)?.canonicalize_utf8()?;
        Ok((dir, true))
    }

    /// Remove a mount point we created, unless something is still mounted
    /// below it.
    fn remove_mount_point(&self, mnt: &Utf8Path) {
        match self.host.mounts_under(mnt) {
            Ok(mounts) if mounts.is_empty() => {
                if let Err(e) = std::fs::remove_dir_all(mnt) {
                    tracing::warn!("Removing mount point {mnt}: {e}");
                }
            }
            Ok(_) => tracing::warn!("Leaving {mnt} in place; it still has mounts"),
            Err(e) => tracing::warn!("Leaving {mnt} in place: {e:#}"),
        }
    }

    /// Run the whole apply.
    pub(crate) fn run(&self, req: &ApplyRequest) -> Result<()> {
        self.validate(req)?;
        let image = format::detect(&req.image)?;
        let flow = Flow::for_image(&image, req.efi_image.is_some());
        tracing::info!("Applying to {} ({} image)", image.path, image.format);
        if flow.ignores_efi_image {
            tracing::warn!("{} is a partitioned disk; ignoring the EFI image", image.path);
        }
        self.check_intermediates(&image.path, &flow)?;
        self.interrupt.check()?;

        let (mnt, temporary) = self.mount_point(req)?;
        let r = if flow.sparse {
            self.run_sparse(&image.path, &flow, req, &mnt)
        } else {
            self.run_mounted(&image.path, &flow, req, &mnt)
        };
        if temporary {
            self.remove_mount_point(&mnt);
        }
        if r.is_ok() {
            tracing::info!("Applied to {}", image.path);
        }
        r
    }

    /// Decode, apply to the raw intermediate, and re-encode over the
    /// original only if all of that worked.
    fn run_sparse(
        &self,
        image: &Utf8Path,
        flow: &Flow,
        req: &ApplyRequest,
        mnt: &Utf8Path,
    ) -> Result<()> {
        let raw = self.intermediate(image, "raw");
        let codec = SparseCodec::new(self.host, self.config.sparse_slack_bytes()?);
        let r = codec
            .decode(image, &raw)
            .and_then(|()| self.interrupt.check())
            .and_then(|()| self.run_mounted(&raw, flow, req, mnt))
            .and_then(|()| self.interrupt.check());
        if let Err(e) = r {
            remove_intermediate(&raw);
            return Err(e);
        }
        // On failure the raw image stays for recovery
        codec.encode(&raw, image)?;
        remove_intermediate(&raw);
        Ok(())
    }

    /// Attach, mount, apply, and release; for a container flow, copy the
    /// result back once the devices are gone.
    fn run_mounted(
        &self,
        image: &Utf8Path,
        flow: &Flow,
        req: &ApplyRequest,
        mnt: &Utf8Path,
    ) -> Result<()> {
        let mut loops = LoopStack(Vec::new());
        let mut container = None;
        let r = self.attach_and_apply(image, flow, req, mnt, &mut loops, &mut container);
        let mut warnings = loops.release();
        let r = match container {
            Some(c) => {
                let r = r
                    .and_then(|()| self.interrupt.check())
                    .and_then(|()| c.copy_back(image));
                if let Err(error) = c.discard() {
                    tracing::warn!("{error:#}");
                    warnings.push(TeardownWarning {
                        resource: "temporary container".into(),
                        error,
                    });
                }
                r
            }
            None => r,
        };
        if !warnings.is_empty() {
            tracing::warn!("{} loop device(s) or files could not be released", warnings.len());
        }
        r
    }

    fn slots(&self) -> Slots {
        Slots {
            root: self.config.root_partition,
            efi: self.config.efi_partition,
        }
    }

    fn attach_and_apply(
        &self,
        image: &Utf8Path,
        flow: &Flow,
        req: &ApplyRequest,
        mnt: &Utf8Path,
        loops: &mut LoopStack<H::Device>,
        container: &mut Option<TemporaryContainer>,
    ) -> Result<()> {
        let (root, efi, disks) = match flow.mount {
            MountFlow::Plain => {
                let dev = loops.push(self.host.attach(image, AttachOptions::PLAIN)?);
                let dev = dev.path().to_owned();
                (dev.clone(), None, vec![dev])
            }
            MountFlow::PlainWithEfi => {
                let efi_image = req
                    .efi_image
                    .as_deref()
                    .ok_or_else(|| anyhow!("Missing EFI image"))?;
                let path = self.intermediate(image, "container");
                let slack = self.config.container_slack_bytes()?;
                let c = container.insert(TemporaryContainer::create(self.host, image, &path, slack)?);
                self.interrupt.check()?;
                // The container is always written with 512-byte sectors
                let opts = AttachOptions::partitioned(None);
                let disk = loops.push(self.host.attach(c.path(), opts)?);
                let disk_path = disk.path().to_owned();
                let root = Locator::new(self.host, disk, self.slots()).locate_root()?;
                let efi = loops.push(self.host.attach(efi_image, AttachOptions::PLAIN)?);
                let efi = efi.path().to_owned();
                (root, Some(efi.clone()), vec![disk_path, efi])
            }
            MountFlow::Disk => {
                let opts = AttachOptions::partitioned(flow.disk_sector_size);
                let disk = loops.push(self.host.attach(image, opts)?);
                let disk_path = disk.path().to_owned();
                let set = Locator::new(self.host, disk, self.slots()).locate()?;
                (set.root, set.efi, vec![disk_path])
            }
        };
        self.interrupt.check()?;

        let mut session = MountSession::new(self.host, mnt);
        let r = self.run_session(&mut session, &root, efi.as_deref(), &disks, req, mnt);
        session.release();
        r
    }

    fn run_session<M: MountOps>(
        &self,
        session: &mut MountSession<'_, M>,
        root: &Utf8Path,
        efi: Option<&Utf8Path>,
        disks: &[Utf8PathBuf],
        req: &ApplyRequest,
        mnt: &Utf8Path,
    ) -> Result<()> {
        session.acquire_root(root)?;
        self.interrupt.check()?;
        session.bind_pseudo_filesystems()?;
        if let Some(efi) = efi {
            session.mount_efi(efi);
        }
        session.write_device_map(disks);
        session.activate();
        self.interrupt.check()?;

        let invocation = OverlayInvocation {
            mount_point: mnt.to_owned(),
            target: req.target.clone(),
            resources: req.resources.clone(),
            overlay_dirs: req.overlay_dirs.clone(),
        };
        match req.debug {
            DebugMode::Off => self.apply_overlay(&invocation),
            DebugMode::Pre => {
                self.debug_shell(DebugShell::Host(mnt.to_owned()))?;
                self.interrupt.check()?;
                self.apply_overlay(&invocation)
            }
            DebugMode::Post => {
                let r = self.apply_overlay(&invocation);
                if self.interrupt.is_triggered() {
                    return r;
                }
                if let Err(e) = &r {
                    tracing::error!("{e:#}");
                    tracing::info!("Opening the debug shell anyway");
                }
                let shell = self.debug_shell(DebugShell::Chroot(mnt.to_owned()));
                r.and(shell)
            }
        }
    }

    /// Ctrl-C at the shell's prompt is meant for the shell, not for us.
    fn debug_shell(&self, shell: DebugShell) -> Result<()> {
        let _sigint = self.interrupt.yield_sigint();
        self.host.interactive_shell(&shell)
    }

    fn apply_overlay(&self, invocation: &OverlayInvocation) -> Result<()> {
        if let Err(e) = self.host.apply_overlay(invocation) {
            // The tool most likely failed because it was signalled too
            self.interrupt.check()?;
            return Err(ApplyError::CollaboratorFailure(e).into());
        }
        Ok(())
    }
}

/// Run an apply against the real system.
pub(crate) fn apply(config: &Config, req: &ApplyRequest, interrupt: &Interrupt) -> Result<()> {
    let host = LinuxHost::new(config);
    Applier::new(&host, config, interrupt).run(req)
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::FileExt;

    use super::*;
    use crate::format::fixtures;
    use crate::partitions::ESP_GUID;
    use crate::session::PSEUDO_FILESYSTEMS;
    use crate::testutil::{FakeHost, Op};
    use rootpatch_blockdev::Probe;

    const MIB: u64 = 1024 * 1024;

    struct Env {
        _td: tempfile::TempDir,
        dir: Utf8PathBuf,
        mnt: Utf8PathBuf,
        config: Config,
        request: ApplyRequest,
    }

    impl Env {
        fn new(image_contents: &[u8]) -> Self {
            let td = tempfile::tempdir().unwrap();
            let dir = Utf8Path::from_path(td.path())
                .unwrap()
                .canonicalize_utf8()
                .unwrap();
            let overlays = dir.join("overlays");
            let mnt = dir.join("mnt");
            let work = dir.join("work");
            for d in [&overlays, &mnt, &work] {
                std::fs::create_dir(d).unwrap();
            }
            let image = dir.join("rootfs.img");
            std::fs::write(&image, image_contents).unwrap();
            let config = Config {
                work_dir: Some(work),
                ..Default::default()
            };
            let request = ApplyRequest {
                image,
                efi_image: None,
                target: OverlayTarget::Stack("base".into()),
                resources: None,
                overlay_dirs: vec![overlays],
                debug: DebugMode::Off,
                mount_point: Some(mnt.clone()),
            };
            Env {
                _td: td,
                dir,
                mnt,
                config,
                request,
            }
        }

        fn run(&self, host: &FakeHost) -> Result<()> {
            self.run_with(host, &Interrupt::default())
        }

        fn run_with(&self, host: &FakeHost, interrupt: &Interrupt) -> Result<()> {
            Applier::new(host, &self.config, interrupt).run(&self.request)
        }

        fn work(&self, name: &str) -> Utf8PathBuf {
            self.dir.join("work").join(name)
        }

        fn invocation(&self) -> Op {
            Op::Overlay(OverlayInvocation {
                mount_point: self.mnt.clone(),
                target: self.request.target.clone(),
                resources: None,
                overlay_dirs: self.request.overlay_dirs.clone(),
            })
        }

        fn mount_root(&self, dev: &str) -> Vec<Op> {
            let mut r = vec![Op::Mount(dev.into(), self.mnt.clone(), "ext4".into())];
            r.extend(PSEUDO_FILESYSTEMS.iter().map(|p| Op::Bind(self.mnt.join(p))));
            r
        }

        fn unmount_root(&self) -> Vec<Op> {
            let mut r: Vec<Op> = PSEUDO_FILESYSTEMS
                .iter()
                .rev()
                .map(|p| Op::Unmount(self.mnt.join(p)))
                .collect();
            r.push(Op::Unmount(self.mnt.clone()));
            r
        }
    }

    fn ext4_probe() -> Probe {
        Probe {
            fstype: Some("ext4".into()),
            ..Default::default()
        }
    }

    fn esp_probe() -> Probe {
        Probe {
            fstype: Some("vfat".into()),
            parttype: Some(ESP_GUID.into()),
            ..Default::default()
        }
    }

    fn apply_error(r: Result<()>) -> ApplyError {
        let e = r.unwrap_err();
        match e.downcast::<ApplyError>() {
            Ok(e) => e,
            Err(e) => panic!("unexpected error {e:#}"),
        }
    }

    #[test]
    fn test_plain() {
        let env = Env::new(&fixtures::ext4(8192));
        let host = FakeHost::default();
        env.run(&host).unwrap();
        let mut expected = vec![Op::Attach(env.request.image.clone(), false, None)];
        expected.extend(env.mount_root("/dev/loop0"));
        expected.push(env.invocation());
        expected.extend(env.unmount_root());
        expected.push(Op::Detach("/dev/loop0".into()));
        similar_asserts::assert_eq!(host.take_ops(), expected);
        assert!(host.mounted().is_empty());
    }

    #[test]
    fn test_disk() {
        let env = Env::new(&fixtures::gpt(512));
        let host = FakeHost {
            partitions: vec![(1, ext4_probe()), (2, esp_probe())],
            ..Default::default()
        };
        env.run(&host).unwrap();
        let mut expected = vec![Op::Attach(env.request.image.clone(), true, None)];
        expected.extend(env.mount_root("/dev/loop0p1"));
        expected.push(Op::Mount(
            "/dev/loop0p2".into(),
            env.mnt.join("boot/efi"),
            "vfat".into(),
        ));
        expected.push(env.invocation());
        expected.push(Op::Unmount(env.mnt.join("boot/efi")));
        expected.extend(env.unmount_root());
        expected.push(Op::Detach("/dev/loop0".into()));
        similar_asserts::assert_eq!(host.take_ops(), expected);
    }

    #[test]
    fn test_disk_4k_sectors() {
        let env = Env::new(&fixtures::gpt(4096));
        let host = FakeHost {
            partitions: vec![(1, ext4_probe())],
            ..Default::default()
        };
        env.run(&host).unwrap();
        let ops = host.take_ops();
        assert_eq!(ops[0], Op::Attach(env.request.image.clone(), true, Some(4096)));
        assert!(ops.contains(&Op::Mount(
            "/dev/loop0p1".into(),
            env.mnt.clone(),
            "ext4".into()
        )));
    }

    #[test]
    fn test_disk_mapper_fallback_and_ignored_efi() {
        let mut env = Env::new(&fixtures::mbr());
        let efi = env.dir.join("efi.img");
        std::fs::write(&efi, b"fat").unwrap();
        env.request.efi_image = Some(efi);
        let host = FakeHost {
            kernel_nodes: false,
            partitions: vec![(1, ext4_probe())],
            ..Default::default()
        };
        env.run(&host).unwrap();
        let ops = host.take_ops();
        let attaches = ops.iter().filter(|o| matches!(o, Op::Attach(..))).count();
        assert_eq!(attaches, 1);
        assert!(ops.contains(&Op::Mount(
            "/dev/mapper/loop0p1".into(),
            env.mnt.clone(),
            "ext4".into()
        )));
        assert_eq!(
            &ops[ops.len() - 2..],
            [Op::Unmap("/dev/loop0".into()), Op::Detach("/dev/loop0".into())]
        );
    }

    #[test]
    fn test_root_not_found() {
        let env = Env::new(&fixtures::gpt(512));
        let host = FakeHost {
            partitions: vec![(1, esp_probe())],
            ..Default::default()
        };
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::RootPartitionNotFound { .. }));
        let ops = host.take_ops();
        assert!(!ops.iter().any(|o| matches!(o, Op::Mount(..) | Op::Overlay(_))));
        assert_eq!(ops.last(), Some(&Op::Detach("/dev/loop0".into())));
    }

    #[test]
    fn test_collaborator_failure() {
        let env = Env::new(&fixtures::ext4(8192));
        let host = FakeHost {
            fail_collaborator: true,
            ..Default::default()
        };
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::CollaboratorFailure(_)));
        assert!(host.mounted().is_empty());
        assert_eq!(host.take_ops().last(), Some(&Op::Detach("/dev/loop0".into())));
    }

    #[test]
    fn test_bind_failure() {
        let env = Env::new(&fixtures::ext4(8192));
        let host = FakeHost {
            fail_bind: vec!["run"],
            ..Default::default()
        };
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::MountFailure { .. }));
        let ops = host.take_ops();
        assert!(!ops.iter().any(|o| matches!(o, Op::Overlay(_))));
        assert!(host.mounted().is_empty());
        let tail = [
            Op::Unmount(env.mnt.join("sys")),
            Op::Unmount(env.mnt.join("proc")),
            Op::Unmount(env.mnt.join("dev")),
            Op::Unmount(env.mnt.clone()),
            Op::Detach("/dev/loop0".into()),
        ];
        assert_eq!(&ops[ops.len() - tail.len()..], tail);
    }

    #[test]
    fn test_root_mount_failure() {
        let env = Env::new(&fixtures::ext4(8192));
        let host = FakeHost {
            fail_mount: vec!["mnt"],
            ..Default::default()
        };
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::MountFailure { .. }));
        similar_asserts::assert_eq!(
            host.take_ops(),
            [
                Op::Attach(env.request.image.clone(), false, None),
                Op::Mount("/dev/loop0".into(), env.mnt.clone(), "ext4".into()),
                Op::Detach("/dev/loop0".into()),
            ]
        );
    }

    #[test]
    fn test_debug_modes() {
        let mut env = Env::new(&fixtures::ext4(8192));
        let shell_and_overlay = |host: &FakeHost| -> Vec<Op> {
            host.take_ops()
                .into_iter()
                .filter(|o| matches!(o, Op::Overlay(_) | Op::Shell(_)))
                .collect()
        };

        env.request.debug = DebugMode::Pre;
        let host = FakeHost::default();
        env.run(&host).unwrap();
        assert_eq!(
            shell_and_overlay(&host),
            [Op::Shell(DebugShell::Host(env.mnt.clone())), env.invocation()]
        );

        env.request.debug = DebugMode::Post;
        let host = FakeHost::default();
        env.run(&host).unwrap();
        assert_eq!(
            shell_and_overlay(&host),
            [env.invocation(), Op::Shell(DebugShell::Chroot(env.mnt.clone()))]
        );

        // Still get a shell to look around after a failure
        let host = FakeHost {
            fail_collaborator: true,
            ..Default::default()
        };
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::CollaboratorFailure(_)));
        assert_eq!(
            shell_and_overlay(&host),
            [env.invocation(), Op::Shell(DebugShell::Chroot(env.mnt.clone()))]
        );
        assert!(host.mounted().is_empty());
    }

    #[test]
    fn test_plain_with_efi() {
        let contents: Vec<u8> = (0..3 * 4096u32).map(|i| (i % 253) as u8).collect();
        let mut env = Env::new(&contents);
        let efi = env.dir.join("efi.img");
        std::fs::write(&efi, vec![0u8; 4096]).unwrap();
        env.request.efi_image = Some(efi.clone());
        std::fs::create_dir_all(env.mnt.join("boot/grub")).unwrap();
        let container = env.work("rootfs.img.container");

        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let host = FakeHost {
            partitions: vec![(1, ext4_probe())],
            on_overlay: Some(Box::new({
                let container = container.clone();
                let device_map = env.mnt.join("boot/grub/device.map");
                let seen = seen.clone();
                move |_| {
                    let f = std::fs::OpenOptions::new().write(true).open(&container).unwrap();
                    f.write_all_at(b"patched", MIB).unwrap();
                    *seen.borrow_mut() = Some((
                        f.metadata().unwrap().len(),
                        std::fs::read_to_string(&device_map).unwrap(),
                    ));
                }
            })),
            ..Default::default()
        };
        env.run(&host).unwrap();

        let (container_len, device_map) = seen.borrow_mut().take().unwrap();
        assert_eq!(container_len, contents.len() as u64 + 4 * MIB);
        assert_eq!(device_map, "(hd0)\t/dev/loop0\n(hd1)\t/dev/loop1\n");
        assert!(!env.mnt.join("boot/grub/device.map").exists());

        let ops = host.take_ops();
        assert!(matches!(&ops[0], Op::PartitionTable(p, _) if p == &container));
        assert_eq!(ops[1], Op::Attach(container.clone(), true, None));
        assert_eq!(ops[2], Op::Attach(efi, false, None));
        assert!(ops.contains(&Op::Mount(
            "/dev/loop1".into(),
            env.mnt.join("boot/efi"),
            "vfat".into()
        )));
        assert_eq!(
            &ops[ops.len() - 2..],
            [Op::Detach("/dev/loop1".into()), Op::Detach("/dev/loop0".into())]
        );

        let updated = std::fs::read(&env.request.image).unwrap();
        assert_eq!(&updated[..7], b"patched");
        assert_eq!(&updated[7..], &contents[7..]);
        assert!(!container.exists());
    }

    #[test]
    fn test_plain_with_efi_failure_leaves_image() {
        let contents = fixtures::ext4(8192);
        let mut env = Env::new(&contents);
        let efi = env.dir.join("efi.img");
        std::fs::write(&efi, vec![0u8; 4096]).unwrap();
        env.request.efi_image = Some(efi);
        let container = env.work("rootfs.img.container");
        let host = FakeHost {
            partitions: vec![(1, ext4_probe())],
            fail_collaborator: true,
            on_overlay: Some(Box::new({
                let container = container.clone();
                move |_| {
                    let f = std::fs::OpenOptions::new().write(true).open(&container).unwrap();
                    f.write_all_at(b"patched", MIB).unwrap();
                }
            })),
            ..Default::default()
        };
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::CollaboratorFailure(_)));
        assert_eq!(std::fs::read(&env.request.image).unwrap(), contents);
        assert!(!container.exists());
    }

    #[test]
    fn test_sparse() {
        let env = Env::new(&fixtures::sparse_header());
        let host = FakeHost::default();
        env.run(&host).unwrap();
        let raw = env.work("rootfs.img.raw");
        let ops = host.take_ops();
        assert_eq!(ops[0], Op::Decode(env.request.image.clone()));
        assert_eq!(ops[1], Op::Attach(raw.clone(), false, None));
        let detach = ops
            .iter()
            .position(|o| o == &Op::Detach("/dev/loop0".into()))
            .unwrap();
        assert_eq!(
            &ops[detach + 1..],
            [
                Op::Check(raw.clone()),
                Op::MinimumSize(raw.clone()),
                Op::Resize(raw.clone(), 260 * MIB),
                Op::Encode(raw.clone(), env.dir.join("rootfs.img.partial")),
            ]
        );
        assert!(!raw.exists());
        assert!(format::is_sparse_header(&std::fs::read(&env.request.image).unwrap()));
    }

    #[test]
    fn test_sparse_failures() {
        // Apply failed: the original is untouched, the raw image discarded
        let env = Env::new(&fixtures::sparse_header());
        let host = FakeHost {
            fail_collaborator: true,
            ..Default::default()
        };
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::CollaboratorFailure(_)));
        assert!(!host.take_ops().iter().any(|o| matches!(o, Op::Check(_) | Op::Encode(..))));
        assert!(!env.work("rootfs.img.raw").exists());
        assert_eq!(std::fs::read(&env.request.image).unwrap(), fixtures::sparse_header());

        // Re-encoding failed: the raw image is kept
        let env = Env::new(&fixtures::sparse_header());
        let host = FakeHost {
            fail_resize: true,
            ..Default::default()
        };
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::ResizeOrCheckFailure { .. }));
        assert!(env.work("rootfs.img.raw").exists());
        assert_eq!(std::fs::read(&env.request.image).unwrap(), fixtures::sparse_header());

        // And blocks the next run until dealt with
        let host = FakeHost::default();
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::InvalidArguments(_)));
        assert!(host.take_ops().is_empty());
    }

    #[test]
    fn test_validation_precedes_resources() {
        let mut env = Env::new(&fixtures::ext4(8192));
        env.request.overlay_dirs.push(env.dir.join("nonexistent"));
        let host = FakeHost::default();
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::InvalidArguments(_)));
        assert!(host.take_ops().is_empty());

        let mut env = Env::new(&fixtures::ext4(8192));
        env.request.efi_image = Some(env.dir.join("missing-efi.img"));
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::InvalidImage { .. }));
        assert!(host.take_ops().is_empty());

        let env = Env::new(&[]);
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::InvalidImage { .. }));
        assert!(host.take_ops().is_empty());

        let env = Env::new(&fixtures::ext4(8192));
        host.mounted.borrow_mut().push(env.mnt.clone());
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::InvalidArguments(_)));
        assert!(host.take_ops().is_empty());
    }

    #[test]
    fn test_interrupted() {
        let env = Env::new(&fixtures::sparse_header());
        let interrupt = Interrupt::default();
        let host = FakeHost {
            on_overlay: Some(Box::new({
                let interrupt = interrupt.clone();
                move |_| interrupt.trigger("SIGTERM")
            })),
            ..Default::default()
        };
        let e = apply_error(env.run_with(&host, &interrupt));
        assert!(matches!(e, ApplyError::Interrupted("SIGTERM")));
        assert!(host.mounted().is_empty());
        let ops = host.take_ops();
        assert!(!ops.iter().any(|o| matches!(o, Op::Encode(..))));
        assert!(ops.contains(&Op::Detach("/dev/loop0".into())));
        assert!(!env.work("rootfs.img.raw").exists());

        // A signal that makes the tool fail is reported as the signal
        let env = Env::new(&fixtures::ext4(8192));
        let interrupt = Interrupt::default();
        let host = FakeHost {
            fail_collaborator: true,
            on_overlay: Some(Box::new({
                let interrupt = interrupt.clone();
                move |_| interrupt.trigger("SIGINT")
            })),
            ..Default::default()
        };
        let e = apply_error(env.run_with(&host, &interrupt));
        assert!(matches!(e, ApplyError::Interrupted("SIGINT")));
    }

    #[test]
    fn test_ctrl_c_in_debug_shell() {
        let mut env = Env::new(&fixtures::ext4(8192));
        env.request.debug = DebugMode::Pre;
        let interrupt = Interrupt::default();
        let host = FakeHost {
            on_shell: Some(Box::new({
                let interrupt = interrupt.clone();
                move |_| interrupt.trigger("SIGINT")
            })),
            ..Default::default()
        };
        env.run_with(&host, &interrupt).unwrap();
        let ops = host.take_ops();
        let shell = ops.iter().position(|o| matches!(o, Op::Shell(_))).unwrap();
        assert_eq!(ops[shell + 1], env.invocation());
        assert!(!interrupt.is_triggered());

        // Only while the shell runs
        let env = Env::new(&fixtures::ext4(8192));
        let host = FakeHost {
            fail_collaborator: true,
            on_overlay: Some(Box::new({
                let interrupt = interrupt.clone();
                move |_| interrupt.trigger("SIGINT")
            })),
            ..Default::default()
        };
        let e = apply_error(env.run_with(&host, &interrupt));
        assert!(matches!(e, ApplyError::Interrupted("SIGINT")));

        // Termination still ends the apply
        let mut env = Env::new(&fixtures::ext4(8192));
        env.request.debug = DebugMode::Pre;
        let interrupt = Interrupt::default();
        let host = FakeHost {
            on_shell: Some(Box::new({
                let interrupt = interrupt.clone();
                move |_| interrupt.trigger("SIGHUP")
            })),
            ..Default::default()
        };
        let e = apply_error(env.run_with(&host, &interrupt));
        assert!(matches!(e, ApplyError::Interrupted("SIGHUP")));
        assert!(!host.take_ops().iter().any(|o| matches!(o, Op::Overlay(_))));
        assert!(host.mounted().is_empty());
    }

    #[test]
    fn test_symlinked_mount_point() {
        let mut env = Env::new(&fixtures::ext4(8192));
        let link = env.dir.join("mnt-link");
        std::os::unix::fs::symlink(&env.mnt, &link).unwrap();
        env.request.mount_point = Some(link);
        let host = FakeHost::default();
        env.run(&host).unwrap();
        let ops = host.take_ops();
        assert!(ops.contains(&Op::Mount("/dev/loop0".into(), env.mnt.clone(), "ext4".into())));
        assert!(ops.contains(&env.invocation()));
        assert!(host.mounted().is_empty());

        // A relative spelling resolves to the same place
        let mut env = Env::new(&fixtures::ext4(8192));
        env.request.mount_point = Some(env.dir.join("work/../mnt"));
        let host = FakeHost::default();
        env.run(&host).unwrap();
        assert!(host
            .take_ops()
            .contains(&Op::Mount("/dev/loop0".into(), env.mnt.clone(), "ext4".into())));

        // Already mounted, seen through the link
        let mut env = Env::new(&fixtures::ext4(8192));
        let link = env.dir.join("mnt-link");
        std::os::unix::fs::symlink(&env.mnt, &link).unwrap();
        env.request.mount_point = Some(link);
        let host = FakeHost::default();
        host.mounted.borrow_mut().push(env.mnt.clone());
        let e = apply_error(env.run(&host));
        assert!(matches!(e, ApplyError::InvalidArguments(_)));
        assert!(host.take_ops().is_empty());

        // Stale mounts below the resolved path are swept on teardown
        let mut env = Env::new(&fixtures::ext4(8192));
        let link = env.dir.join("mnt-link");
        std::os::unix::fs::symlink(&env.mnt, &link).unwrap();
        env.request.mount_point = Some(link);
        let host = FakeHost::default();
        host.mounted.borrow_mut().push(env.mnt.join("run/stale"));
        env.run(&host).unwrap();
        assert!(host.mounted().is_empty());
        assert!(host.take_ops().contains(&Op::Unmount(env.mnt.join("run/stale"))));
    }

    #[test]
    fn test_temporary_mount_point() {
        let mut env = Env::new(&fixtures::ext4(8192));
        env.request.mount_point = None;
        let host = FakeHost::default();
        env.run(&host).unwrap();
        let ops = host.take_ops();
        let mnt = ops
            .iter()
            .find_map(|o| match o {
                Op::Mount(_, target, _) => Some(target.clone()),
                _ => None,
            })
            .unwrap();
        assert!(mnt.starts_with(env.work("")));
        assert!(mnt.file_name().unwrap().starts_with("rootpatch-"));
        assert!(!mnt.exists());
    }
}
