// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! USB mass-storage gadget orchestration via Linux configfs.
//!
//! The host's mass-storage client caches its view of the LUN. Mutating the
//! backing image while the host is reading causes cache incoherence on our
//! side and I/O timeouts on theirs. The state machine here makes that
//! impossible: the image is only ever written in the `Ready` state, after the
//! gadget has been unbound from the UDC.
//!
//!   1. `unexpose()`: disconnect from the host
//!   2. `prepare_image()`: mount locally, copy fresh files, sync, unmount
//!   3. `expose()`: rebind so the host sees the updated pendrive

use std::{
    fmt,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{debug, error, info, warn};

pub const CONFIGFS_GADGET_ROOT: &str = "/sys/kernel/config/usb_gadget";

const UDC_CLASS_DIR: &str = "/sys/class/udc";

/// The privileged platform operations the orchestrator needs. Everything else
/// about the gadget lifecycle lives in [`UsbGadget`] itself, so a test
/// harness can drive the full state machine against an instrumented
/// implementation of this trait.
pub trait PlatformBackend {
    /// Allocate a zero-filled backing file of `size_mib` MiB.
    fn allocate_image(&self, path: &Path, size_mib: u64) -> io::Result<()>;

    /// Format the backing file as FAT32 with the given volume label.
    fn format_fat32(&self, path: &Path, label: &str) -> io::Result<()>;

    /// Loop-mount the backing file at `mount_point`.
    fn mount_loop(&self, image: &Path, mount_point: &Path) -> io::Result<()>;

    fn unmount(&self, mount_point: &Path) -> io::Result<()>;

    /// Flush pending writes to the backing file.
    fn sync_filesystems(&self) -> io::Result<()>;

    /// Create one directory of the configfs gadget skeleton, including any
    /// missing parents.
    fn create_config_dir(&self, path: &Path) -> io::Result<()>;

    /// Remove one (empty) directory of the configfs gadget skeleton.
    fn remove_config_dir(&self, path: &Path) -> io::Result<()>;

    /// Link a configuration to a function (`link` -> `target`).
    fn create_config_link(&self, target: &Path, link: &Path) -> io::Result<()>;

    fn remove_config_link(&self, link: &Path) -> io::Result<()>;

    /// Write a short string to a configfs attribute file.
    fn write_attribute(&self, path: &Path, value: &str) -> io::Result<()>;

    /// Enumerate the available USB device controller names.
    fn list_udcs(&self) -> io::Result<Vec<String>>;

    /// Copy a file into the locally mounted image, creating any missing
    /// parent directories below the mount point.
    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Delete a file inside the locally mounted image.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// List the names of the regular files directly inside `dir`.
    fn list_files(&self, dir: &Path) -> io::Result<Vec<String>>;

    fn exists(&self, path: &Path) -> bool;
}

impl<B: PlatformBackend + ?Sized> PlatformBackend for &B {
    fn allocate_image(&self, path: &Path, size_mib: u64) -> io::Result<()> {
        (**self).allocate_image(path, size_mib)
    }

    fn format_fat32(&self, path: &Path, label: &str) -> io::Result<()> {
        (**self).format_fat32(path, label)
    }

    fn mount_loop(&self, image: &Path, mount_point: &Path) -> io::Result<()> {
        (**self).mount_loop(image, mount_point)
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        (**self).unmount(mount_point)
    }

    fn sync_filesystems(&self) -> io::Result<()> {
        (**self).sync_filesystems()
    }

    fn create_config_dir(&self, path: &Path) -> io::Result<()> {
        (**self).create_config_dir(path)
    }

    fn remove_config_dir(&self, path: &Path) -> io::Result<()> {
        (**self).remove_config_dir(path)
    }

    fn create_config_link(&self, target: &Path, link: &Path) -> io::Result<()> {
        (**self).create_config_link(target, link)
    }

    fn remove_config_link(&self, link: &Path) -> io::Result<()> {
        (**self).remove_config_link(link)
    }

    fn write_attribute(&self, path: &Path, value: &str) -> io::Result<()> {
        (**self).write_attribute(path, value)
    }

    fn list_udcs(&self) -> io::Result<Vec<String>> {
        (**self).list_udcs()
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        (**self).copy_file(src, dst)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        (**self).remove_file(path)
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<String>> {
        (**self).list_files(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }
}

/// Production backend. Uses native calls wherever the kernel interface is a
/// plain file operation and falls back to a narrow argv-list command runner
/// (never a shell string) for the remaining privileged utilities.
pub struct LinuxBackend;

impl LinuxBackend {
    fn run(program: &str, args: &[&str]) -> io::Result<()> {
        let status = Command::new(program).args(args).status()?;

        if !status.success() {
            return Err(io::Error::other(format!("{program} exited with {status}")));
        }

        Ok(())
    }
}

impl PlatformBackend for LinuxBackend {
    fn allocate_image(&self, path: &Path, size_mib: u64) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(path)?;
        file.set_len(size_mib * 1024 * 1024)?;

        Ok(())
    }

    fn format_fat32(&self, path: &Path, label: &str) -> io::Result<()> {
        Self::run("mkfs.vfat", &["-n", label, &path.to_string_lossy()])
    }

    fn mount_loop(&self, image: &Path, mount_point: &Path) -> io::Result<()> {
        fs::create_dir_all(mount_point)?;

        Self::run(
            "mount",
            &[
                "-o",
                "loop",
                &image.to_string_lossy(),
                &mount_point.to_string_lossy(),
            ],
        )
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        Self::run("umount", &[&mount_point.to_string_lossy()])
    }

    fn sync_filesystems(&self) -> io::Result<()> {
        Self::run("sync", &[])
    }

    fn create_config_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_config_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    #[cfg(unix)]
    fn create_config_link(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(not(unix))]
    fn create_config_link(&self, _target: &Path, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "configfs is only available on Linux",
        ))
    }

    fn remove_config_link(&self, link: &Path) -> io::Result<()> {
        fs::remove_file(link)
    }

    fn write_attribute(&self, path: &Path, value: &str) -> io::Result<()> {
        fs::write(path, value)
    }

    fn list_udcs(&self) -> io::Result<Vec<String>> {
        let mut udcs = vec![];

        for entry in fs::read_dir(UDC_CLASS_DIR)? {
            let entry = entry?;
            udcs.push(entry.file_name().to_string_lossy().into_owned());
        }

        udcs.sort();

        Ok(udcs)
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::copy(src, dst)?;

        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = vec![];

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        Ok(names)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Clone, Debug)]
pub struct GadgetConfig {
    /// FAT32 backing file presented to the host as the pendrive.
    pub image_path: PathBuf,
    /// Where the backing file is loop-mounted for local writes.
    pub mount_point: PathBuf,
    /// Configfs gadget name.
    pub gadget_name: String,
    pub image_size_mib: u64,
    pub vendor_id: String,
    pub product_id: String,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub volume_label: String,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            image_path: PathBuf::from("/var/syncdrive/usb/drive.img"),
            mount_point: PathBuf::from("/var/syncdrive/usb/mnt"),
            gadget_name: "syncdrive".to_owned(),
            image_size_mib: 64,
            // Linux Foundation / Multifunction Composite Gadget.
            vendor_id: "0x1d6b".to_owned(),
            product_id: "0x0104".to_owned(),
            manufacturer: "SyncDrive".to_owned(),
            product: "SyncDrive".to_owned(),
            serial_number: "000000000001".to_owned(),
            volume_label: "SYNCDRIVE".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UsbState {
    Uninitialized,
    Ready,
    Exposed,
}

impl fmt::Display for UsbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Exposed => "exposed",
        };
        f.write_str(s)
    }
}

/// The gadget lifecycle state machine. All methods are synchronous and must
/// not be invoked re-entrantly; `refresh` in particular assumes it is the
/// only caller mutating the instance.
pub struct UsbGadget<B: PlatformBackend> {
    backend: B,
    config: GadgetConfig,
    state: UsbState,
}

impl<B: PlatformBackend> UsbGadget<B> {
    pub fn new(backend: B, config: GadgetConfig) -> Self {
        Self {
            backend,
            config,
            state: UsbState::Uninitialized,
        }
    }

    pub fn state(&self) -> UsbState {
        self.state
    }

    pub fn is_exposed(&self) -> bool {
        self.state == UsbState::Exposed
    }

    fn gadget_dir(&self) -> PathBuf {
        Path::new(CONFIGFS_GADGET_ROOT).join(&self.config.gadget_name)
    }

    fn udc_attr(&self) -> PathBuf {
        self.gadget_dir().join("UDC")
    }

    fn lun_file_attr(&self) -> PathBuf {
        self.gadget_dir().join("functions/mass_storage.usb0/lun.0/file")
    }

    /// One-time setup: backing image + FAT32 format + configfs skeleton.
    /// Idempotent; a second call in the `Ready` or `Exposed` state is a
    /// successful no-op. The gadget is left unbound (UDC attribute empty), so
    /// the host sees nothing until `expose()`.
    pub fn init(&mut self) -> bool {
        if self.state != UsbState::Uninitialized {
            return true;
        }

        info!("Initializing USB mass-storage gadget");

        if let Err(e) = self.create_image() {
            error!("Failed to create disk image: {e}");
            return false;
        }

        if let Err(e) = self
            .backend
            .format_fat32(&self.config.image_path, &self.config.volume_label)
        {
            error!("Failed to format image as FAT32: {e}");
            return false;
        }

        if let Err(e) = self.setup_configfs() {
            error!("Failed to create configfs gadget (is configfs mounted and libcomposite loaded?): {e}");
            return false;
        }

        self.state = UsbState::Ready;
        info!("USB gadget ready");
        true
    }

    fn create_image(&self) -> io::Result<()> {
        if self.backend.exists(&self.config.image_path) {
            debug!("Image already exists: {:?}", self.config.image_path);
            return Ok(());
        }

        info!(
            "Creating {} MiB image: {:?}",
            self.config.image_size_mib, self.config.image_path,
        );

        self.backend
            .allocate_image(&self.config.image_path, self.config.image_size_mib)
    }

    fn setup_configfs(&self) -> io::Result<()> {
        let gadget_dir = self.gadget_dir();

        if self.backend.exists(&gadget_dir.join("UDC")) {
            debug!("Configfs gadget already exists");
            return Ok(());
        }

        self.backend.create_config_dir(&gadget_dir)?;
        self.backend
            .write_attribute(&gadget_dir.join("idVendor"), &self.config.vendor_id)?;
        self.backend
            .write_attribute(&gadget_dir.join("idProduct"), &self.config.product_id)?;
        self.backend
            .write_attribute(&gadget_dir.join("bcdUSB"), "0x0200")?;
        self.backend
            .write_attribute(&gadget_dir.join("bcdDevice"), "0x0100")?;

        let str_dir = gadget_dir.join("strings/0x409");
        self.backend.create_config_dir(&str_dir)?;
        self.backend
            .write_attribute(&str_dir.join("manufacturer"), &self.config.manufacturer)?;
        self.backend
            .write_attribute(&str_dir.join("product"), &self.config.product)?;
        self.backend
            .write_attribute(&str_dir.join("serialnumber"), &self.config.serial_number)?;

        let cfg_dir = gadget_dir.join("configs/c.1");
        self.backend.create_config_dir(&cfg_dir)?;

        let cfg_str_dir = cfg_dir.join("strings/0x409");
        self.backend.create_config_dir(&cfg_str_dir)?;
        self.backend
            .write_attribute(&cfg_str_dir.join("configuration"), "Mass Storage")?;
        self.backend.write_attribute(&cfg_dir.join("MaxPower"), "120")?;

        let func_dir = gadget_dir.join("functions/mass_storage.usb0");
        self.backend.create_config_dir(&func_dir)?;

        // lun.0 is created by the kernel along with the function. The LUN
        // stays read-only to the host; all updates happen offline.
        let lun_dir = func_dir.join("lun.0");
        self.backend.write_attribute(&lun_dir.join("file"), "")?;
        self.backend.write_attribute(&lun_dir.join("removable"), "1")?;
        self.backend.write_attribute(&lun_dir.join("ro"), "1")?;
        self.backend.write_attribute(&lun_dir.join("nofua"), "1")?;

        let link = cfg_dir.join("mass_storage.usb0");
        if !self.backend.exists(&link) {
            self.backend.create_config_link(&func_dir, &link)?;
        }

        debug!("Configfs gadget skeleton created");
        Ok(())
    }

    /// Write the desired contents into the image: copy every
    /// `(source_path, dest_name)` pair into the mount, then delete any file
    /// whose name is not in the set. Individual copy failures are logged and
    /// counted; only a mount or unmount failure fails the call.
    pub fn prepare_image(&mut self, files: &[(PathBuf, String)]) -> bool {
        if self.state != UsbState::Ready {
            warn!("Cannot prepare image in state {}", self.state);
            return false;
        }

        if let Err(e) = self
            .backend
            .mount_loop(&self.config.image_path, &self.config.mount_point)
        {
            error!("Failed to mount image: {e}");
            return false;
        }

        let mut copied = 0usize;
        for (src, dest_name) in files {
            let dst = self.config.mount_point.join(dest_name);
            match self.backend.copy_file(src, &dst) {
                Ok(()) => copied += 1,
                Err(e) => warn!("Copy failed: {src:?} -> {dest_name}: {e}"),
            }
        }

        // Drop files that are no longer in the source set.
        match self.backend.list_files(&self.config.mount_point) {
            Ok(names) => {
                for name in names {
                    if !files.iter().any(|(_, dest_name)| *dest_name == name) {
                        let path = self.config.mount_point.join(&name);
                        if let Err(e) = self.backend.remove_file(&path) {
                            warn!("Failed to remove stale file: {path:?}: {e}");
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to enumerate image contents: {e}"),
        }

        info!("Prepared image: {copied}/{} files copied", files.len());

        if let Err(e) = self.backend.sync_filesystems() {
            warn!("Failed to sync filesystems: {e}");
        }

        if let Err(e) = self.backend.unmount(&self.config.mount_point) {
            error!("Failed to unmount image: {e}");
            return false;
        }

        true
    }

    /// Point the LUN at the backing image and bind the gadget to the first
    /// available UDC. Failure leaves the state at `Ready`.
    pub fn expose(&mut self) -> bool {
        if self.state != UsbState::Ready {
            warn!("Cannot expose gadget in state {}", self.state);
            return false;
        }

        if let Err(e) = self.backend.write_attribute(
            &self.lun_file_attr(),
            &self.config.image_path.to_string_lossy(),
        ) {
            error!("Cannot set LUN backing file: {e}");
            return false;
        }

        let udc = match self.backend.list_udcs() {
            Ok(udcs) => match udcs.into_iter().next() {
                Some(udc) => udc,
                None => {
                    error!("No USB device controller found");
                    return false;
                }
            },
            Err(e) => {
                error!("Failed to enumerate USB device controllers: {e}");
                return false;
            }
        };

        if let Err(e) = self.backend.write_attribute(&self.udc_attr(), &udc) {
            error!("Failed to bind gadget to UDC {udc}: {e}");
            return false;
        }

        self.state = UsbState::Exposed;
        info!("Gadget exposed on UDC {udc}");
        true
    }

    /// Unbind from the UDC (the host sees a disconnect) and clear the LUN
    /// backing file. A no-op success outside the `Exposed` state.
    pub fn unexpose(&mut self) -> bool {
        if self.state != UsbState::Exposed {
            return true;
        }

        // If the unbind fails, the host may still be reading. Stay in
        // Exposed so nothing ever writes to a live image.
        if let Err(e) = self.backend.write_attribute(&self.udc_attr(), "") {
            error!("Failed to unbind gadget from UDC: {e}");
            return false;
        }

        if let Err(e) = self.backend.write_attribute(&self.lun_file_attr(), "") {
            warn!("Failed to clear LUN backing file: {e}");
        }

        self.state = UsbState::Ready;
        info!("Gadget unexposed");
        true
    }

    /// Full refresh cycle: unexpose, rewrite the image contents, re-expose.
    /// If the rewrite fails, the previous contents are re-exposed best-effort
    /// so the host is not left without a device.
    pub fn refresh(&mut self, files: &[(PathBuf, String)]) -> bool {
        debug!("Refreshing USB drive contents");

        if !self.unexpose() {
            error!("Failed to unexpose; aborting refresh");
            return false;
        }

        if !self.prepare_image(files) {
            error!("Failed to prepare image; re-exposing previous contents");
            self.expose();
            return false;
        }

        if !self.expose() {
            error!("Failed to re-expose after refresh");
            return false;
        }

        true
    }

    /// Tear everything down: unexpose, unmount (best-effort), remove the
    /// configfs skeleton in reverse order of creation.
    pub fn cleanup(&mut self) {
        info!("Cleaning up USB gadget");

        self.unexpose();

        if let Err(e) = self.backend.unmount(&self.config.mount_point) {
            debug!("Image not unmounted during cleanup: {e}");
        }

        self.teardown_configfs();

        self.state = UsbState::Uninitialized;
    }

    fn teardown_configfs(&self) {
        let gadget_dir = self.gadget_dir();

        if !self.backend.exists(&gadget_dir) {
            return;
        }

        if let Err(e) = self.backend.write_attribute(&gadget_dir.join("UDC"), "") {
            debug!("Failed to clear UDC during teardown: {e}");
        }

        let link = gadget_dir.join("configs/c.1/mass_storage.usb0");
        if self.backend.exists(&link) {
            if let Err(e) = self.backend.remove_config_link(&link) {
                warn!("Failed to remove configfs link: {link:?}: {e}");
            }
        }

        // Configfs only allows removing empty directories, so this has to be
        // the reverse of the creation order.
        for dir in [
            gadget_dir.join("configs/c.1/strings/0x409"),
            gadget_dir.join("configs/c.1"),
            gadget_dir.join("functions/mass_storage.usb0"),
            gadget_dir.join("strings/0x409"),
            gadget_dir.clone(),
        ] {
            if let Err(e) = self.backend.remove_config_dir(&dir) {
                debug!("Failed to remove configfs dir: {dir:?}: {e}");
            }
        }

        debug!("Configfs gadget removed");
    }
}
