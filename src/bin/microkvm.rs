//! microkvm CLI tool
//!
//! Boots a Linux kernel under KVM with a serial console on the current
//! terminal.

use std::io;
use std::path::PathBuf;
use std::process;

use vmm_sys_util::terminal::Terminal;

use microkvm::{runner, timer::TickTimer, KernelLoader, Vm};

/// Kernel parameters the guest always gets; `--params` appends to these.
const DEFAULT_CMDLINE: &str = "notsc nolapic nosmp noacpi pci=conf1 console=ttyS0";

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

struct Options {
    kernel: PathBuf,
    image: Option<PathBuf>,
    initrd: Option<PathBuf>,
    params: Option<String>,
    kvm_dev: PathBuf,
    memory_mb: u32,
    single_step: bool,
    ioport_debug: bool,
}

fn print_usage(program: &str) {
    eprintln!(
        "  usage: {} [--single-step] [--ioport-debug] \
         [--kvm-dev=<device>] [--mem=<size-in-MiB>] [--params=<kernel-params>] \
         [--initrd=<initrd>] [--kernel=]<kernel-image> [--image=<disk-image>]",
        program
    );
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut kernel: Option<PathBuf> = None;
    let mut image: Option<PathBuf> = None;
    let mut initrd: Option<PathBuf> = None;
    let mut params: Option<String> = None;
    let mut kvm_dev = PathBuf::from("/dev/kvm");
    let mut memory_mb: u32 = 64;
    let mut single_step = false;
    let mut ioport_debug = false;

    for arg in args {
        if let Some(v) = arg.strip_prefix("--kernel=") {
            kernel = Some(PathBuf::from(v));
        } else if let Some(v) = arg.strip_prefix("--image=") {
            image = Some(PathBuf::from(v));
        } else if let Some(v) = arg.strip_prefix("--initrd=") {
            initrd = Some(PathBuf::from(v));
        } else if let Some(v) = arg.strip_prefix("--params=") {
            params = Some(v.to_string());
        } else if let Some(v) = arg.strip_prefix("--kvm-dev=") {
            kvm_dev = PathBuf::from(v);
        } else if let Some(v) = arg.strip_prefix("--mem=") {
            memory_mb = v
                .parse()
                .map_err(|_| format!("bad memory size: {}", v))?;
        } else if arg == "--single-step" {
            single_step = true;
        } else if arg == "--ioport-debug" {
            ioport_debug = true;
        } else if arg.starts_with('-') {
            return Err(format!("unknown option: {}", arg));
        } else {
            // Any bare argument is the kernel image.
            kernel = Some(PathBuf::from(arg));
        }
    }

    let kernel = kernel.ok_or_else(|| "kernel image path is required".to_string())?;

    Ok(Options {
        kernel,
        image,
        initrd,
        params,
        kvm_dev,
        memory_mb,
        single_step,
        ioport_debug,
    })
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    let opts = match parse_args(&args[1..]) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("{}", msg);
            print_usage(&args[0]);
            return Err(msg.into());
        }
    };

    if let Some(ref image) = opts.image {
        eprintln!(
            "warning: virtio-blk is not wired up, ignoring disk image {}",
            image.display()
        );
    }

    let mut vm = Vm::builder()
        .memory_mb(opts.memory_mb)
        .kvm_dev(&opts.kvm_dev)
        .single_step(opts.single_step)
        .ioport_debug(opts.ioport_debug)
        .build()?;

    let mut cmdline = String::from(DEFAULT_CMDLINE);
    if let Some(ref params) = opts.params {
        cmdline.push(' ');
        cmdline.push_str(params);
    }

    let mut loader = KernelLoader::new(&opts.kernel)?.with_cmdline(cmdline);
    if let Some(ref initrd) = opts.initrd {
        loader = loader.with_initrd(initrd)?;
    }

    let info = vm.load_kernel(&loader)?;
    vm.reset_vcpu()?;

    println!("microkvm: booting {} ({:?})", opts.kernel.display(), info.format);

    runner::install_signal_handlers()?;
    let _timer = TickTimer::start()?;
    let _tty = RawTtyGuard::new();

    vm.run()?;

    Ok(())
}

/// Puts the terminal in raw mode for the guest console and restores
/// canonical mode on every exit path.
struct RawTtyGuard {
    active: bool,
}

impl RawTtyGuard {
    fn new() -> Self {
        let is_tty = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
        let active = is_tty && io::stdin().lock().set_raw_mode().is_ok();
        Self { active }
    }
}

impl Drop for RawTtyGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = io::stdin().lock().set_canon_mode();
        }
    }
}
