use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use log::{info, warn};

use crate::config::VmDefinition;
use crate::settings::{expand_home, HypervisorSettings};

/// Result of asking a process to terminate.
#[derive(Debug, PartialEq, Eq)]
pub enum Termination {
    Signalled,
    AlreadyGone,
}

fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    // 0 and negative values address process groups, never a single VM
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// Whether `pid` names a live process. EPERM still means it exists.
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = to_pid_t(pid) else {
        return false;
    };

    let res = unsafe { libc::kill(pid, 0) };
    if res == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send SIGTERM to `pid`. A process that no longer exists is not an error.
pub fn terminate(pid: u32) -> io::Result<Termination> {
    let Some(pid) = to_pid_t(pid) else {
        return Ok(Termination::AlreadyGone);
    };

    let res = unsafe { libc::kill(pid, libc::SIGTERM) };
    if res == 0 {
        return Ok(Termination::Signalled);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(Termination::AlreadyGone)
    } else {
        Err(err)
    }
}

/// Arguments handed to the hypervisor for `def`.
pub fn vm_args(def: &VmDefinition, headless: bool) -> Vec<String> {
    let image = expand_home(Path::new(&def.image_path));

    let mut args = vec![
        "-m".to_string(),
        def.ram_mb.to_string(),
        "-smp".to_string(),
        def.cpu_cores.to_string(),
        "-hda".to_string(),
        image.to_string_lossy().to_string(),
        "-netdev".to_string(),
        format!("user,id=net0,hostfwd=tcp::{}-:22", def.ssh_port),
        "-device".to_string(),
        "virtio-net-pci,netdev=net0".to_string(),
        "-device".to_string(),
        "virtio-rng-pci".to_string(),
    ];

    if headless {
        args.push("-display".to_string());
        args.push("none".to_string());
    } else if let Some(vnc) = def.vnc_port.filter(|p| *p >= 5900) {
        args.push("-vnc".to_string());
        args.push(format!(":{}", vnc - 5900));
    }

    args
}

fn log_target(def: &VmDefinition) -> (Stdio, Stdio) {
    let Some(log_path) = def.log_file_path() else {
        return (Stdio::null(), Stdio::null());
    };

    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).unwrap_or_else(|e| {
            warn!("Could not create log directory {:?}: {}", dir, e);
        });
    }

    let open = |path: &Path| -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    };

    match (open(&log_path), open(&log_path)) {
        (Ok(out), Ok(err)) => (Stdio::from(out), Stdio::from(err)),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Could not open VM log file {:?}: {}", log_path, e);
            (Stdio::null(), Stdio::null())
        }
    }
}

/// Spawn the hypervisor for `def` in its own process group, with output
/// appended to the VM log file.
pub fn spawn(hypervisor: &HypervisorSettings, def: &VmDefinition, headless: bool) -> io::Result<Child> {
    let (stdout, stderr) = log_target(def);

    let mut command = Command::new(&hypervisor.program);
    command
        .args(&hypervisor.prefix_args)
        .args(vm_args(def, headless))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);

    let child = command.spawn()?;
    info!(
        "Spawned {} for VM '{}' with PID: {}",
        hypervisor.program,
        def.name,
        child.id()
    );
    Ok(child)
}

/// Wait for `child` on a background thread so it never lingers as a zombie.
pub fn reap_in_background(mut child: Child) {
    std::thread::spawn(move || {
        let _ = child.wait();
    });
}
