//! ELF import slot patcher.
//!
//! The import slots of an ELF image are the GOT entries targeted by its `GLOB_DAT` and
//! `JUMP_SLOT` relocations, found through the `DT_RELA` and `DT_JMPREL` tables of the image's
//! dynamic section.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::io;
use std::mem::size_of;
use std::path::Path;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Module;
use crate::error::{Error, Result};

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_JMPREL: i64 = 23;

/// Relocation types whose target is an import slot holding a symbol's absolute address.
#[cfg(target_arch = "x86_64")]
const SLOT_RELOCATIONS: &[u32] = &[
    6, // R_X86_64_GLOB_DAT
    7, // R_X86_64_JUMP_SLOT
];
#[cfg(target_arch = "aarch64")]
const SLOT_RELOCATIONS: &[u32] = &[
    1025, // R_AARCH64_GLOB_DAT
    1026, // R_AARCH64_JUMP_SLOT
];
#[cfg(target_arch = "riscv64")]
const SLOT_RELOCATIONS: &[u32] = &[
    2, // R_RISCV_64
    5, // R_RISCV_JUMP_SLOT
];
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
const SLOT_RELOCATIONS: &[u32] = &[];

#[repr(C)]
struct Dyn {
    tag: i64,
    value: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct Rela {
    offset: u64,
    info: u64,
    addend: i64,
}

#[repr(C)]
#[allow(dead_code)]
struct Sym {
    name: u32,
    info: u8,
    other: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

/// Returns the address `module` exports for `symbol`. The module must already be loaded.
pub fn export_address(module: &str, symbol: &str) -> Result<usize> {
    let export_not_found = || Error::ExportNotFound {
        module: module.to_string(),
        symbol: symbol.to_string(),
    };
    let c_module = CString::new(module).map_err(|_| Error::ModuleNotFound(module.to_string()))?;
    let c_symbol = CString::new(symbol).map_err(|_| export_not_found())?;

    let handle = unsafe { libc::dlopen(c_module.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
    if handle.is_null() {
        return Err(Error::ModuleNotFound(module.to_string()));
    }
    let address = unsafe { libc::dlsym(handle, c_symbol.as_ptr()) } as usize;
    // balances the reference taken by dlopen; the module stays loaded
    unsafe { libc::dlclose(handle) };

    if address == 0 {
        Err(export_not_found())
    } else {
        Ok(address)
    }
}

struct Segment {
    start: usize,
    end: usize,
    prot: c_int,
}

/// The relocation tables of one loaded image.
pub struct Image {
    base: usize,
    segments: Vec<Segment>,
    relro: Option<(usize, usize)>,
    strtab: usize,
    symtab: usize,
    /// `(address, size in bytes)` of `DT_RELA` and `DT_JMPREL`.
    tables: [(usize, usize); 2],
}

struct Search<'a> {
    module: &'a Module,
    index: usize,
    image: Option<Image>,
}

unsafe extern "C" fn visit_image(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let search = unsafe { &mut *data.cast::<Search<'_>>() };
    let info = unsafe { &*info };
    let index = search.index;
    search.index += 1;

    let name = if info.dlpi_name.is_null() {
        Default::default()
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name) }.to_string_lossy()
    };
    let matches = match search.module {
        // the main program is always reported first
        Module::Main => index == 0,
        Module::Named(wanted) => {
            !name.is_empty()
                && (name == wanted.as_str()
                    || Path::new(&*name)
                        .file_name()
                        .is_some_and(|file| file == wanted.as_str()))
        }
    };
    if !matches || info.dlpi_phdr.is_null() {
        return 0;
    }

    let headers = unsafe { slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) };
    search.image = unsafe { Image::parse(info.dlpi_addr as usize, headers) };
    1
}

impl Image {
    /// Finds the loaded image of `module`.
    pub fn find(module: &Module) -> Result<Self> {
        let mut search = Search {
            module,
            index: 0,
            image: None,
        };
        unsafe {
            libc::dl_iterate_phdr(Some(visit_image), (&mut search as *mut Search<'_>).cast());
        }
        search
            .image
            .ok_or_else(|| Error::ModuleNotFound(module.to_string()))
    }

    /// # Safety
    ///
    /// `headers` must be the program headers of the image loaded at `base`.
    unsafe fn parse(base: usize, headers: &[libc::Elf64_Phdr]) -> Option<Self> {
        let mut dynamic = None;
        let mut segments = Vec::new();
        let mut relro = None;
        for header in headers {
            let start = base + header.p_vaddr as usize;
            let end = start + header.p_memsz as usize;
            match header.p_type {
                libc::PT_DYNAMIC => dynamic = Some(start as *const Dyn),
                libc::PT_LOAD => segments.push(Segment {
                    start,
                    end,
                    prot: protection_of(header.p_flags),
                }),
                libc::PT_GNU_RELRO => relro = Some((start, end)),
                _ => {}
            }
        }

        let mut image = Self {
            base,
            segments,
            relro,
            strtab: 0,
            symtab: 0,
            tables: [(0, 0); 2],
        };
        let mut entry = dynamic?;
        loop {
            let Dyn { tag, value } = unsafe { entry.read() };
            // glibc relocates these in place; other loaders leave them image-relative
            let address = image.absolute(value as usize);
            match tag {
                DT_NULL => break,
                DT_STRTAB => image.strtab = address,
                DT_SYMTAB => image.symtab = address,
                DT_RELA => image.tables[0].0 = address,
                DT_RELASZ => image.tables[0].1 = value as usize,
                DT_JMPREL => image.tables[1].0 = address,
                DT_PLTRELSZ => image.tables[1].1 = value as usize,
                _ => {}
            }
            entry = unsafe { entry.add(1) };
        }

        (image.strtab != 0 && image.symtab != 0).then_some(image)
    }

    fn absolute(&self, address: usize) -> usize {
        if address < self.base {
            address + self.base
        } else {
            address
        }
    }

    /// Points every import slot for `symbol` holding `from` to `to`; returns the number of slots
    /// which now hold `to`.
    pub fn rewrite_slots(&self, symbol: &str, from: usize, to: usize) -> Result<usize> {
        let mut rewritten = 0;
        for &(table, size) in &self.tables {
            if table == 0 {
                continue;
            }
            let relocations =
                unsafe { slice::from_raw_parts(table as *const Rela, size / size_of::<Rela>()) };
            for relocation in relocations {
                let kind = (relocation.info & 0xffff_ffff) as u32;
                let index = (relocation.info >> 32) as usize;
                if index == 0 || !SLOT_RELOCATIONS.contains(&kind) {
                    continue;
                }
                if self.symbol_name(index).to_bytes() != symbol.as_bytes() {
                    continue;
                }

                let address = self.base + relocation.offset as usize;
                let slot = unsafe { &*(address as *const AtomicUsize) };
                let current = slot.load(Ordering::Acquire);
                if current == to {
                    rewritten += 1;
                } else if current == from {
                    self.write_slot(address, slot, to)?;
                    rewritten += 1;
                }
            }
        }
        Ok(rewritten)
    }

    fn symbol_name(&self, index: usize) -> &CStr {
        unsafe {
            let symbol = &*(self.symtab as *const Sym).add(index);
            CStr::from_ptr((self.strtab + symbol.name as usize) as *const c_char)
        }
    }

    fn write_slot(&self, address: usize, slot: &AtomicUsize, value: usize) -> Result<()> {
        let prot = self.protection(address);
        if prot & libc::PROT_WRITE != 0 {
            slot.store(value, Ordering::Release);
            return Ok(());
        }

        let page_size = page_size();
        let page = (address & !(page_size - 1)) as *mut c_void;
        let protect = |prot| {
            if unsafe { libc::mprotect(page, page_size, prot) } == 0 {
                Ok(())
            } else {
                Err(Error::Protect {
                    address,
                    source: io::Error::last_os_error(),
                })
            }
        };
        protect(libc::PROT_READ | libc::PROT_WRITE)?;
        slot.store(value, Ordering::Release);
        protect(prot)
    }

    /// Protection of the page holding `address` once relocation is complete.
    fn protection(&self, address: usize) -> c_int {
        if let Some((start, end)) = self.relro {
            if (start..end).contains(&address) {
                return libc::PROT_READ;
            }
        }
        self.segments
            .iter()
            .find(|segment| (segment.start..segment.end).contains(&address))
            .map_or(libc::PROT_READ, |segment| segment.prot)
    }
}

fn protection_of(flags: u32) -> c_int {
    let mut prot = libc::PROT_NONE;
    if flags & libc::PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if flags & libc::PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & libc::PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_find_exports() {
        assert!(export_address("libc.so.6", "malloc").is_ok());
        assert!(matches!(
            export_address("libc.so.6", "leakwatch_no_such_symbol"),
            Err(Error::ExportNotFound { .. })
        ));
        assert!(matches!(
            export_address("libleakwatch-not-loaded.so", "malloc"),
            Err(Error::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_should_find_images() {
        let main = Image::find(&Module::Main).expect("main image");
        assert_ne!(main.symtab, 0);
        assert!(Image::find(&Module::named("libc.so.6")).is_ok());
        assert!(matches!(
            Image::find(&Module::named("libleakwatch-not-loaded.so")),
            Err(Error::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_should_leave_unrelated_slots_alone() {
        let main = Image::find(&Module::Main).expect("main image");
        assert_eq!(
            main.rewrite_slots("leakwatch_no_such_symbol", 1, 2).expect("scan"),
            0
        );
    }

    #[test]
    fn test_should_map_segment_flags() {
        assert_eq!(protection_of(libc::PF_R), libc::PROT_READ);
        assert_eq!(
            protection_of(libc::PF_R | libc::PF_W),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(protection_of(0), libc::PROT_NONE);
    }
}
