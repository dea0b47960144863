//! ELF32 analyzer for executable intake.
//!
//! Reads just enough of the image to run it: the header for validation
//! and the entry point, the PT_LOAD program headers for the loadable
//! bytes, and the symbol/string tables for a symbol-to-address map.

use fnv::FnvHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("not an ELF image")]
    NotElf,
    #[error("unsupported ELF image: {0}")]
    Unsupported(&'static str),
    #[error("truncated ELF image")]
    Truncated,
}

const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EM_RISCV: u16 = 0xf3;

pub const PT_LOAD: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;

/// ELF header, 32-bit layout.
pub struct Header {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF program header, 32-bit layout.
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// ELF section header, 32-bit layout.
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

/// ELF32 symbol table entry.
pub struct SymbolEntry {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

pub struct ElfAnalyzer {
    data: Vec<u8>,
}

impl ElfAnalyzer {
    #[must_use]
    pub const fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Checks the ELF magic number.
    #[must_use]
    pub fn validate(&self) -> bool {
        self.data.len() >= 4 && self.data[0..4] == [0x7f, 0x45, 0x4c, 0x46]
    }

    fn read_u8(&self, offset: usize) -> Result<u8, ElfError> {
        self.data.get(offset).copied().ok_or(ElfError::Truncated)
    }

    fn read_u16(&self, offset: usize) -> Result<u16, ElfError> {
        let bytes = self
            .data
            .get(offset..offset + 2)
            .ok_or(ElfError::Truncated)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self, offset: usize) -> Result<u32, ElfError> {
        let bytes = self
            .data
            .get(offset..offset + 4)
            .ok_or(ElfError::Truncated)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Slice of the image's file contents, for segment loading.
    pub fn bytes(&self, offset: u32, len: u32) -> Result<&[u8], ElfError> {
        self.data
            .get(offset as usize..(offset as usize) + len as usize)
            .ok_or(ElfError::Truncated)
    }

    /// Reads and validates the ELF header: 32-bit, little endian, RISC-V.
    pub fn read_header(&self) -> Result<Header, ElfError> {
        if !self.validate() {
            return Err(ElfError::NotElf);
        }
        if self.read_u8(4)? != ELFCLASS32 {
            return Err(ElfError::Unsupported("not a 32-bit image"));
        }
        if self.read_u8(5)? != ELFDATA2LSB {
            return Err(ElfError::Unsupported("not little endian"));
        }
        let header = Header {
            e_type: self.read_u16(0x10)?,
            e_machine: self.read_u16(0x12)?,
            e_entry: self.read_u32(0x18)?,
            e_phoff: self.read_u32(0x1c)?,
            e_shoff: self.read_u32(0x20)?,
            e_phentsize: self.read_u16(0x2a)?,
            e_phnum: self.read_u16(0x2c)?,
            e_shentsize: self.read_u16(0x2e)?,
            e_shnum: self.read_u16(0x30)?,
            e_shstrndx: self.read_u16(0x32)?,
        };
        if header.e_machine != EM_RISCV {
            return Err(ElfError::Unsupported("not a RISC-V image"));
        }
        Ok(header)
    }

    pub fn read_program_headers(&self, header: &Header) -> Result<Vec<ProgramHeader>, ElfError> {
        let mut headers = Vec::with_capacity(header.e_phnum as usize);
        for i in 0..header.e_phnum {
            let offset =
                header.e_phoff as usize + usize::from(i) * usize::from(header.e_phentsize);
            headers.push(ProgramHeader {
                p_type: self.read_u32(offset)?,
                p_offset: self.read_u32(offset + 0x04)?,
                p_vaddr: self.read_u32(offset + 0x08)?,
                p_paddr: self.read_u32(offset + 0x0c)?,
                p_filesz: self.read_u32(offset + 0x10)?,
                p_memsz: self.read_u32(offset + 0x14)?,
                p_flags: self.read_u32(offset + 0x18)?,
                p_align: self.read_u32(offset + 0x1c)?,
            });
        }
        Ok(headers)
    }

    pub fn read_section_headers(&self, header: &Header) -> Result<Vec<SectionHeader>, ElfError> {
        let mut headers = Vec::with_capacity(header.e_shnum as usize);
        for i in 0..header.e_shnum {
            let offset =
                header.e_shoff as usize + usize::from(i) * usize::from(header.e_shentsize);
            headers.push(SectionHeader {
                sh_name: self.read_u32(offset)?,
                sh_type: self.read_u32(offset + 0x04)?,
                sh_flags: self.read_u32(offset + 0x08)?,
                sh_addr: self.read_u32(offset + 0x0c)?,
                sh_offset: self.read_u32(offset + 0x10)?,
                sh_size: self.read_u32(offset + 0x14)?,
                sh_link: self.read_u32(offset + 0x18)?,
                sh_info: self.read_u32(offset + 0x1c)?,
                sh_addralign: self.read_u32(offset + 0x20)?,
                sh_entsize: self.read_u32(offset + 0x24)?,
            });
        }
        Ok(headers)
    }

    fn read_symbol_entries(&self, symtab: &SectionHeader) -> Result<Vec<SymbolEntry>, ElfError> {
        const SYM_ENTRY_SIZE: u32 = 16;
        let count = symtab.sh_size / SYM_ENTRY_SIZE;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let offset = (symtab.sh_offset + i * SYM_ENTRY_SIZE) as usize;
            entries.push(SymbolEntry {
                st_name: self.read_u32(offset)?,
                st_value: self.read_u32(offset + 0x04)?,
                st_size: self.read_u32(offset + 0x08)?,
                st_info: self.read_u8(offset + 0x0c)?,
                st_other: self.read_u8(offset + 0x0d)?,
                st_shndx: self.read_u16(offset + 0x0e)?,
            });
        }
        Ok(entries)
    }

    fn read_string(&self, strtab: &SectionHeader, index: u32) -> Result<String, ElfError> {
        let mut offset = (strtab.sh_offset + index) as usize;
        let mut s = String::new();
        loop {
            match self.read_u8(offset)? {
                0 => return Ok(s),
                c => s.push(c as char),
            }
            offset += 1;
        }
    }

    /// Builds a symbol-name to address map from every SYMTAB section,
    /// resolving names through the section's linked string table.
    pub fn create_symbol_map(&self, header: &Header) -> Result<FnvHashMap<String, u32>, ElfError> {
        let sections = self.read_section_headers(header)?;
        let mut map = FnvHashMap::default();
        for symtab in sections.iter().filter(|sh| sh.sh_type == SHT_SYMTAB) {
            let Some(strtab) = sections.get(symtab.sh_link as usize) else {
                continue;
            };
            if strtab.sh_type != SHT_STRTAB {
                continue;
            }
            for entry in self.read_symbol_entries(symtab)? {
                let name = self.read_string(strtab, entry.st_name)?;
                if !name.is_empty() {
                    map.insert(name, entry.st_value);
                }
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PT_LOAD;

    /// Builds a minimal ELF32 RISC-V image: one PT_LOAD segment holding
    /// `payload`, plus a symtab with one symbol "main".
    pub fn synthetic_elf(entry: u32, load_addr: u32, payload: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 0x34]; // ELF header size
        image[0..4].copy_from_slice(&[0x7f, 0x45, 0x4c, 0x46]);
        image[4] = 1; // ELFCLASS32
        image[5] = 1; // little endian
        image[6] = 1; // EV_CURRENT

        let set16 = |image: &mut Vec<u8>, off: usize, v: u16| {
            image[off..off + 2].copy_from_slice(&v.to_le_bytes());
        };
        let set32 = |image: &mut Vec<u8>, off: usize, v: u32| {
            image[off..off + 4].copy_from_slice(&v.to_le_bytes());
        };

        set16(&mut image, 0x10, 2); // ET_EXEC
        set16(&mut image, 0x12, 0xf3); // EM_RISCV
        set32(&mut image, 0x18, entry);

        // one program header right after the ELF header
        let phoff = 0x34;
        set32(&mut image, 0x1c, phoff);
        set16(&mut image, 0x2a, 0x20);
        set16(&mut image, 0x2c, 1);

        let payload_off = phoff + 0x20;
        let mut ph = vec![0u8; 0x20];
        ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        ph[4..8].copy_from_slice(&(payload_off as u32).to_le_bytes());
        ph[8..12].copy_from_slice(&load_addr.to_le_bytes());
        ph[12..16].copy_from_slice(&load_addr.to_le_bytes());
        ph[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        ph[20..24].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        image.extend_from_slice(&ph);
        image.extend_from_slice(payload);

        // sections: null, symtab (1 entry), strtab
        let strtab_content = b"\0main\0";
        let symtab_off = image.len();
        let mut sym = vec![0u8; 16]; // null symbol
        let mut main_sym = vec![0u8; 16];
        main_sym[0..4].copy_from_slice(&1u32.to_le_bytes()); // name offset
        main_sym[4..8].copy_from_slice(&load_addr.to_le_bytes());
        sym.extend_from_slice(&main_sym);
        image.extend_from_slice(&sym);
        let strtab_off = image.len();
        image.extend_from_slice(strtab_content);

        let shoff = image.len();
        set32(&mut image, 0x20, shoff as u32);
        set16(&mut image, 0x2e, 0x28);
        set16(&mut image, 0x30, 3);

        let mut sh = vec![0u8; 0x28 * 3];
        let set_sh32 = |sh: &mut Vec<u8>, section: usize, field: usize, v: u32| {
            let off = section * 0x28 + field;
            sh[off..off + 4].copy_from_slice(&v.to_le_bytes());
        };
        // section 1: symtab, linked to strtab (section 2)
        set_sh32(&mut sh, 1, 0x04, 2); // SHT_SYMTAB
        set_sh32(&mut sh, 1, 0x10, symtab_off as u32);
        set_sh32(&mut sh, 1, 0x14, 32);
        set_sh32(&mut sh, 1, 0x18, 2); // sh_link
        // section 2: strtab
        set_sh32(&mut sh, 2, 0x04, 3); // SHT_STRTAB
        set_sh32(&mut sh, 2, 0x10, strtab_off as u32);
        set_sh32(&mut sh, 2, 0x14, strtab_content.len() as u32);
        image.extend_from_slice(&sh);

        image
    }
}
