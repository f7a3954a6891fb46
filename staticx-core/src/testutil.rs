//! Builders for synthetic ELF images used across the test suites.

pub(crate) struct ElfBuilder {
    sections: Vec<(String, Vec<u8>)>,
    phdrs: Vec<(u32, usize)>,
}

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;

impl ElfBuilder {
    pub(crate) fn new() -> Self {
        Self {
            sections: Vec::new(),
            phdrs: Vec::new(),
        }
    }

    /// Append a `PROGBITS` section, returning a handle for
    /// [`Self::add_program_header`].
    pub(crate) fn add_section(&mut self, name: &str, data: Vec<u8>) -> usize {
        self.sections.push((name.to_owned(), data));
        self.sections.len() - 1
    }

    /// Append a program header whose file range covers `section`'s data.
    pub(crate) fn add_program_header(&mut self, p_type: u32, section: usize) {
        self.phdrs.push((p_type, section));
    }

    /// Lay the image out: header, program headers, section contents, the
    /// section-name string table, then the section-header table.
    pub(crate) fn build(&self) -> Vec<u8> {
        let phnum = self.phdrs.len() as u64;
        // the index-zero null section and the string table bracket ours
        let shnum = self.sections.len() as u64 + 2;
        let shstrndx = shnum - 1;

        let data_start = EHDR_SIZE + phnum * PHDR_SIZE;
        let mut offsets = Vec::new();
        let mut cursor = data_start;
        for (_, data) in &self.sections {
            offsets.push(cursor);
            cursor += data.len() as u64;
        }

        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _) in &self.sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }
        let strtab_name_offset = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");

        let shstrtab_offset = cursor;
        cursor += shstrtab.len() as u64;
        let shoff = (cursor + 7) & !7;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        push_u16(&mut out, 2); // ET_EXEC
        push_u16(&mut out, 62); // EM_X86_64
        push_u32(&mut out, 1);
        push_u64(&mut out, 0); // e_entry
        push_u64(&mut out, if phnum > 0 { EHDR_SIZE } else { 0 });
        push_u64(&mut out, shoff);
        push_u32(&mut out, 0);
        push_u16(&mut out, EHDR_SIZE as u16);
        push_u16(&mut out, PHDR_SIZE as u16);
        push_u16(&mut out, phnum as u16);
        push_u16(&mut out, SHDR_SIZE as u16);
        push_u16(&mut out, shnum as u16);
        push_u16(&mut out, shstrndx as u16);
        assert_eq!(out.len() as u64, EHDR_SIZE);

        for &(p_type, section) in &self.phdrs {
            let offset = offsets[section];
            let size = self.sections[section].1.len() as u64;
            push_u32(&mut out, p_type);
            push_u32(&mut out, 4); // PF_R
            push_u64(&mut out, offset);
            push_u64(&mut out, offset);
            push_u64(&mut out, offset);
            push_u64(&mut out, size);
            push_u64(&mut out, size);
            push_u64(&mut out, 1);
        }

        for (_, data) in &self.sections {
            out.extend_from_slice(data);
        }
        out.extend_from_slice(&shstrtab);
        out.resize(shoff as usize, 0);

        // null section
        out.extend_from_slice(&[0u8; SHDR_SIZE as usize]);
        for (i, (_, data)) in self.sections.iter().enumerate() {
            push_shdr(&mut out, name_offsets[i], 1, offsets[i], data.len() as u64);
        }
        push_shdr(
            &mut out,
            strtab_name_offset,
            3,
            shstrtab_offset,
            shstrtab.len() as u64,
        );

        out
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn push_shdr(out: &mut Vec<u8>, name: u32, sh_type: u32, offset: u64, size: u64) {
    push_u32(out, name);
    push_u32(out, sh_type);
    push_u64(out, 0); // flags
    push_u64(out, 0); // addr
    push_u64(out, offset);
    push_u64(out, size);
    push_u32(out, 0); // link
    push_u32(out, 0); // info
    push_u64(out, 1); // addralign
    push_u64(out, 0); // entsize
}
