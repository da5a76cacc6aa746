//! VCPU state management.
//!
//! Bring-up seeds the VCPU for a 16-bit real-mode start at the loader's
//! chosen entry point; the diagnostic dumps mirror what the guest-visible
//! state looked like when something went wrong.

use kvm_bindings::{
    kvm_fpu, kvm_guest_debug, kvm_msr_entry, kvm_regs, kvm_segment, kvm_sregs, Msrs,
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd};

use crate::error::{Error, Result};
use crate::loader::BootInfo;
use crate::memory::GuestMemory;

/// Model-specific registers zeroed at reset.
mod msr_index {
    pub const MSR_IA32_TSC: u32 = 0x0000_0010;
    pub const MSR_IA32_SYSENTER_CS: u32 = 0x0000_0174;
    pub const MSR_IA32_SYSENTER_ESP: u32 = 0x0000_0175;
    pub const MSR_IA32_SYSENTER_EIP: u32 = 0x0000_0176;
    pub const MSR_STAR: u32 = 0xc000_0081;
    pub const MSR_LSTAR: u32 = 0xc000_0082;
    pub const MSR_CSTAR: u32 = 0xc000_0083;
    pub const MSR_FMASK: u32 = 0xc000_0084;
    pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;
}

/// KVM on Intel requires segment bases to equal `selector * 16` in real
/// mode.
#[inline]
fn selector_to_base(selector: u16) -> u64 {
    (selector as u64) * 16
}

/// The VM's virtual CPU.
#[derive(Debug)]
pub struct Vcpu {
    fd: VcpuFd,
    /// Last state written by [`Vcpu::reset`], kept for diagnostics.
    regs: kvm_regs,
    sregs: kvm_sregs,
    fpu: kvm_fpu,
}

impl Vcpu {
    pub fn new(fd: VcpuFd) -> Self {
        Self {
            fd,
            regs: kvm_regs::default(),
            sregs: kvm_sregs::default(),
            fpu: kvm_fpu::default(),
        }
    }

    /// Run the guest until the next exit.
    pub fn run(&mut self) -> std::result::Result<VcpuExit, vmm_sys_util::errno::Error> {
        self.fd.run()
    }

    /// Seed the VCPU CPUID from what the host KVM supports.
    pub fn setup_cpuid(&self, kvm: &Kvm) -> Result<()> {
        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| Error::KvmIoctl("KVM_GET_SUPPORTED_CPUID", e))?;
        self.fd
            .set_cpuid2(&cpuid)
            .map_err(|e| Error::KvmIoctl("KVM_SET_CPUID2", e))
    }

    /// Reset the VCPU to the pre-boot real-mode state.
    ///
    /// Ordering is fixed: segment state, general-purpose state, floating
    /// point state, MSRs. Safe to invoke again after a debug stop.
    pub fn reset(&mut self, boot: &BootInfo) -> Result<()> {
        self.setup_sregs(boot)?;
        self.setup_regs(boot)?;
        self.setup_fpu()?;
        self.setup_msrs()
    }

    fn setup_sregs(&mut self, boot: &BootInfo) -> Result<()> {
        let mut sregs = self
            .fd
            .get_sregs()
            .map_err(|e| Error::KvmIoctl("KVM_GET_SREGS", e))?;

        let set = |seg: &mut kvm_segment| {
            seg.selector = boot.selector;
            seg.base = selector_to_base(boot.selector);
        };
        set(&mut sregs.cs);
        set(&mut sregs.ss);
        set(&mut sregs.ds);
        set(&mut sregs.es);
        set(&mut sregs.fs);
        set(&mut sregs.gs);

        self.fd
            .set_sregs(&sregs)
            .map_err(|e| Error::KvmIoctl("KVM_SET_SREGS", e))?;
        self.sregs = sregs;
        Ok(())
    }

    fn setup_regs(&mut self, boot: &BootInfo) -> Result<()> {
        // The guest starts in 16-bit real mode; only the reserved rflags
        // bit is set. BootInfo's 16-bit fields keep rip below 0x10000.
        let regs = kvm_regs {
            rflags: 0x0000_0000_0000_0002,
            rip: boot.ip as u64,
            rsp: boot.sp as u64,
            rbp: boot.sp as u64,
            ..Default::default()
        };

        self.fd
            .set_regs(&regs)
            .map_err(|e| Error::KvmIoctl("KVM_SET_REGS", e))?;
        self.regs = regs;
        Ok(())
    }

    fn setup_fpu(&mut self) -> Result<()> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };

        self.fd
            .set_fpu(&fpu)
            .map_err(|e| Error::KvmIoctl("KVM_SET_FPU", e))?;
        self.fpu = fpu;
        Ok(())
    }

    fn setup_msrs(&mut self) -> Result<()> {
        let entry = |index: u32| kvm_msr_entry {
            index,
            data: 0,
            ..Default::default()
        };
        let entries = [
            entry(msr_index::MSR_IA32_SYSENTER_CS),
            entry(msr_index::MSR_IA32_SYSENTER_ESP),
            entry(msr_index::MSR_IA32_SYSENTER_EIP),
            entry(msr_index::MSR_STAR),
            entry(msr_index::MSR_CSTAR),
            entry(msr_index::MSR_KERNEL_GS_BASE),
            entry(msr_index::MSR_FMASK),
            entry(msr_index::MSR_LSTAR),
            // Zeroing the TSC aligns the guest clock to boot.
            entry(msr_index::MSR_IA32_TSC),
        ];
        let msrs = Msrs::from_entries(&entries)
            .map_err(|e| Error::VcpuError(format!("MSR list: {e}")))?;

        let written = self
            .fd
            .set_msrs(&msrs)
            .map_err(|e| Error::KvmIoctl("KVM_SET_MSRS", e))?;
        if written != entries.len() {
            return Err(Error::VcpuError(format!(
                "KVM_SET_MSRS wrote {written} of {} entries",
                entries.len()
            )));
        }
        Ok(())
    }

    /// Ask for a debug exit after every guest instruction.
    pub fn enable_single_step(&self) -> Result<()> {
        let debug = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP,
            ..Default::default()
        };
        self.fd
            .set_guest_debug(&debug)
            .map_err(|e| Error::KvmIoctl("KVM_SET_GUEST_DEBUG", e))
    }

    /// Last segment state written at reset.
    pub fn boot_sregs(&self) -> &kvm_sregs {
        &self.sregs
    }

    /// Last general-purpose state written at reset.
    pub fn boot_regs(&self) -> &kvm_regs {
        &self.regs
    }

    fn current_state(&self) -> Result<(kvm_regs, kvm_sregs)> {
        let regs = self
            .fd
            .get_regs()
            .map_err(|e| Error::KvmIoctl("KVM_GET_REGS", e))?;
        let sregs = self
            .fd
            .get_sregs()
            .map_err(|e| Error::KvmIoctl("KVM_GET_SREGS", e))?;
        Ok((regs, sregs))
    }

    /// Dump the register file to stderr.
    pub fn show_registers(&self) -> Result<()> {
        let (regs, sregs) = self.current_state()?;

        eprintln!("Registers:");
        eprintln!(
            " rip: {:016x}   rsp: {:016x} flags: {:016x}",
            regs.rip, regs.rsp, regs.rflags
        );
        eprintln!(
            " rax: {:016x}   rbx: {:016x}   rcx: {:016x}",
            regs.rax, regs.rbx, regs.rcx
        );
        eprintln!(
            " rdx: {:016x}   rsi: {:016x}   rdi: {:016x}",
            regs.rdx, regs.rsi, regs.rdi
        );
        eprintln!(
            " rbp: {:016x}   r8:  {:016x}   r9:  {:016x}",
            regs.rbp, regs.r8, regs.r9
        );
        eprintln!(
            " r10: {:016x}   r11: {:016x}   r12: {:016x}",
            regs.r10, regs.r11, regs.r12
        );
        eprintln!(
            " r13: {:016x}   r14: {:016x}   r15: {:016x}",
            regs.r13, regs.r14, regs.r15
        );
        eprintln!(
            " cr0: {:016x}   cr2: {:016x}   cr3: {:016x}",
            sregs.cr0, sregs.cr2, sregs.cr3
        );
        eprintln!(" cr4: {:016x}   cr8: {:016x}", sregs.cr4, sregs.cr8);

        eprintln!("Segment registers:");
        eprintln!(" register  selector  base              limit     type  p dpl db s l g avl");
        print_segment("cs ", &sregs.cs);
        print_segment("ss ", &sregs.ss);
        print_segment("ds ", &sregs.ds);
        print_segment("es ", &sregs.es);
        print_segment("fs ", &sregs.fs);
        print_segment("gs ", &sregs.gs);
        print_segment("tr ", &sregs.tr);
        print_segment("ldt", &sregs.ldt);
        eprintln!(" gdt                 {:016x}  {:08x}", sregs.gdt.base, sregs.gdt.limit);
        eprintln!(" idt                 {:016x}  {:08x}", sregs.idt.base, sregs.idt.limit);
        eprintln!(
            " [ efer: {:016x}  apic base: {:016x} ]",
            sregs.efer, sregs.apic_base
        );

        eprint!("Interrupt bitmap:\n ");
        for word in &sregs.interrupt_bitmap {
            eprint!("{word:016x} ");
        }
        eprintln!();
        Ok(())
    }

    /// Dump a code window around RIP plus a stack sample.
    pub fn show_code(&self, memory: &GuestMemory) -> Result<()> {
        let (regs, sregs) = self.current_state()?;

        let code_bytes: u64 = 64;
        let code_prologue = code_bytes * 43 / 64;

        let rip_flat = ip_to_flat(&sregs, regs.rip);
        let start = rip_flat.wrapping_sub(code_prologue);

        eprint!("Code: ");
        for i in 0..code_bytes {
            let addr = start.wrapping_add(i);
            let p = memory.flat_to_host(addr);
            if !memory.contains(p) {
                break;
            }
            let c = unsafe { *p };
            if addr == rip_flat {
                eprint!("<{c:02x}> ");
            } else {
                eprint!("{c:02x} ");
            }
        }
        eprintln!();

        eprintln!("Stack:");
        dump_mem(memory, regs.rsp, 32);
        Ok(())
    }

    /// Walk the four page-table levels rooted at CR3.
    ///
    /// Prints nothing while the guest is still in real mode.
    pub fn show_page_tables(&self, memory: &GuestMemory) -> Result<()> {
        let (_, sregs) = self.current_state()?;
        if !is_in_protected_mode(&sregs) {
            return Ok(());
        }

        let read = |addr: u64| -> Option<u64> { memory.read_obj::<u64>(addr & !0xfff).ok() };

        let Some(pte4) = read(sregs.cr3) else { return Ok(()) };
        let Some(pte3) = read(pte4) else { return Ok(()) };
        let Some(pte2) = read(pte3) else { return Ok(()) };

        eprintln!("Page Tables:");
        if pte2 & (1 << 7) != 0 {
            eprintln!(" pte4: {pte4:016x}   pte3: {pte3:016x}   pte2: {pte2:016x}");
        } else {
            let Some(pte1) = read(pte2) else { return Ok(()) };
            eprintln!(
                " pte4: {pte4:016x}   pte3: {pte3:016x}   pte2: {pte2:016x}   pte1: {pte1:016x}"
            );
        }
        Ok(())
    }
}

fn print_segment(name: &str, seg: &kvm_segment) {
    eprintln!(
        " {}       {:04x}      {:016x}  {:08x}  {:02x}    {:x} {:x}   {:x}  {:x} {:x} {:x} {:x}",
        name, seg.selector, seg.base, seg.limit, seg.type_, seg.present, seg.dpl, seg.db, seg.s,
        seg.l, seg.g, seg.avl
    );
}

fn is_in_protected_mode(sregs: &kvm_sregs) -> bool {
    sregs.cr0 & 0x1 != 0
}

/// Linear address of an instruction pointer.
///
/// Linux runs a flat memory model, so once the guest is in protected mode
/// the code segment base is taken to be zero.
fn ip_to_flat(sregs: &kvm_sregs, ip: u64) -> u64 {
    if is_in_protected_mode(sregs) {
        return ip;
    }
    ip + ((sregs.cs.selector as u64) << 4)
}

fn dump_mem(memory: &GuestMemory, addr: u64, size: u64) {
    let size = size & !7;
    for n in (0..size).step_by(8) {
        let mut row = [0u8; 8];
        if memory.read(addr + n, &mut row).is_err() {
            break;
        }
        eprintln!(
            "  0x{:08x}: {:02x} {:02x} {:02x} {:02x}  {:02x} {:02x} {:02x} {:02x}",
            addr + n,
            row[0],
            row[1],
            row[2],
            row[3],
            row[4],
            row[5],
            row[6],
            row[7]
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::KernelFormat;

    fn real_mode_boot() -> BootInfo {
        BootInfo {
            selector: 0x1000,
            ip: 0x0200,
            sp: 0x8000,
            format: KernelFormat::BzImage,
        }
    }

    #[test]
    fn test_selector_to_base() {
        assert_eq!(selector_to_base(0x1000), 0x10000);
        assert_eq!(selector_to_base(0x0040), 0x400);
    }

    #[test]
    fn test_ip_to_flat() {
        let mut sregs = kvm_sregs::default();
        sregs.cs.selector = 0x1000;
        assert_eq!(ip_to_flat(&sregs, 0x200), 0x10200);
        sregs.cr0 = 0x1;
        assert_eq!(ip_to_flat(&sregs, 0x10_0000), 0x10_0000);
    }

    #[test]
    fn test_reset_seeds_real_mode() {
        if !crate::kvm::is_available() {
            return;
        }

        let vm = crate::kvm::KvmVm::new(std::path::Path::new("/dev/kvm"), 64 << 20).unwrap();
        let mut vcpu = vm.create_vcpu().unwrap();
        let boot = real_mode_boot();
        vcpu.reset(&boot).unwrap();

        let sregs = vcpu.fd.get_sregs().unwrap();
        assert_eq!(sregs.cs.selector, 0x1000);
        assert_eq!(sregs.cs.base, 0x10000);
        assert_eq!(sregs.ss.base, (sregs.ss.selector as u64) * 16);
        assert_eq!(sregs.cr0 & 0x1, 0);

        let regs = vcpu.fd.get_regs().unwrap();
        assert_eq!(regs.rflags, 2);
        assert_eq!(regs.rip, 0x200);
        assert!(regs.rip <= 0xffff);
        assert_eq!(regs.rsp, 0x8000);
        assert_eq!(regs.rbp, 0x8000);

        let fpu = vcpu.fd.get_fpu().unwrap();
        assert_eq!(fpu.fcw, 0x37f);
        assert_eq!(fpu.mxcsr, 0x1f80);

        // Resetting again lands in the identical pre-boot state.
        vcpu.reset(&boot).unwrap();
        let regs2 = vcpu.fd.get_regs().unwrap();
        assert_eq!(regs2.rip, regs.rip);
        assert_eq!(regs2.rsp, regs.rsp);
        assert_eq!(regs2.rflags, regs.rflags);
    }
}
