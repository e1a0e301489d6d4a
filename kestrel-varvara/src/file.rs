use log::error;
use std::{
    io::{Cursor, Read, Write},
    mem::offset_of,
    path::{Component, Path, PathBuf},
};
use uxn::{Machine, Ports, DEV_SIZE};
use zerocopy::{AsBytes, BigEndian, FromBytes, FromZeroes, U16};

#[derive(AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct FilePorts {
    _vector: U16<BigEndian>,
    success: U16<BigEndian>,
    stat: U16<BigEndian>,
    delete: u8,
    append: u8,
    name: U16<BigEndian>,
    length: U16<BigEndian>,
    read: U16<BigEndian>,
    write: U16<BigEndian>,
}

impl Ports for FilePorts {
    const BASE: u8 = 0xa0;
}

impl FilePorts {
    const STAT_L: u8 = (offset_of!(Self, stat) + 1) as u8;
    const DELETE: u8 = offset_of!(Self, delete) as u8;
    const APPEND: u8 = offset_of!(Self, append) as u8;
    const NAME_L: u8 = (offset_of!(Self, name) + 1) as u8;
    const READ_L: u8 = (offset_of!(Self, read) + 1) as u8;
    const WRITE_L: u8 = (offset_of!(Self, write) + 1) as u8;

    /// Checks whether the port address falls in either file slot
    pub fn matches(t: u8) -> bool {
        (Self::BASE..Self::BASE + 0x20).contains(&t)
    }

    fn dev(vm: &Machine, slot: usize) -> &Self {
        vm.dev_at(Self::BASE + (slot * DEV_SIZE) as u8)
    }

    fn dev_mut(vm: &mut Machine, slot: usize) -> &mut Self {
        vm.dev_mut_at(Self::BASE + (slot * DEV_SIZE) as u8)
    }
}

/// An open handle: a reader or a writer, never both
enum Handle {
    Reader(Box<dyn Read + Send>),
    Writer(std::fs::File),
}

/// One file device slot
///
/// The handle opens lazily on the first read or write trigger and closes
/// when a new name is set.  Mixing reads and writes on one handle is a
/// program bug and panics; host I/O errors merely log and leave the
/// success count at zero.
pub struct File {
    name: Option<PathBuf>,
    append: bool,
    handle: Option<Handle>,
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}

/// Lexically normalizes a ROM-supplied file name
///
/// Absolute paths and paths that escape upward out of the working
/// directory are program bugs.
fn sanitize(name: &str) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0i32;
    for c in Path::new(name).components() {
        match c {
            Component::Prefix(..) | Component::RootDir => {
                panic!("file name {name:?} is not relative");
            }
            Component::CurDir => (),
            Component::ParentDir => {
                if depth == 0 {
                    panic!("file name {name:?} escapes the working directory");
                }
                depth -= 1;
                out.pop();
            }
            Component::Normal(p) => {
                depth += 1;
                out.push(p);
            }
        }
    }
    out
}

/// Formats one stat line: `"%04x name\n"`, with `----` for directories
/// and `????` for files too large to express
fn stat_line(name: &str, meta: &std::fs::Metadata) -> Vec<u8> {
    let size = if meta.is_dir() {
        "----".to_owned()
    } else if meta.len() <= u64::from(u16::MAX) {
        format!("{:04x}", meta.len())
    } else {
        "????".to_owned()
    };
    format!("{size} {name}\n").into_bytes()
}

/// Builds the concatenated stat lines for a directory's children
fn dir_listing(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut entries: Vec<_> = std::fs::read_dir(path)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    let mut out = Vec::new();
    for e in entries {
        let meta = e.metadata()?;
        out.extend_from_slice(&stat_line(&e.file_name().to_string_lossy(), &meta));
    }
    Ok(out)
}

impl File {
    pub fn new() -> Self {
        Self {
            name: None,
            append: false,
            handle: None,
        }
    }

    /// Decodes a port address into a `(slot, offset)` pair
    pub fn decode_target(target: u8) -> (usize, u8) {
        let i = usize::from(target - FilePorts::BASE) / DEV_SIZE;
        (i, target & 0xf)
    }

    pub fn deo(&mut self, vm: &mut Machine, slot: usize, target: u8) {
        match target {
            FilePorts::STAT_L => self.stat(vm, slot),
            FilePorts::DELETE => self.delete(vm, slot),
            FilePorts::APPEND => {
                self.append = FilePorts::dev(vm, slot).append == 0x01;
            }
            FilePorts::NAME_L => self.set_name(vm, slot),
            FilePorts::READ_L => self.read(vm, slot),
            FilePorts::WRITE_L => self.write(vm, slot),
            _ => (),
        }
    }

    /// The configured name, or a panic for ops that require one
    fn require_name(&self, what: &str) -> &Path {
        match &self.name {
            Some(n) => n,
            None => panic!("file {what} before setting name"),
        }
    }

    /// The configured transfer length, or a panic when unset
    fn require_length(vm: &Machine, slot: usize, what: &str) -> u16 {
        let len = FilePorts::dev(vm, slot).length.get();
        if len == 0 {
            panic!("file {what} before setting length (or set zero length)");
        }
        len
    }

    /// Reads the NUL-terminated name string and records the cleaned path
    ///
    /// Setting a name closes any open handle.
    fn set_name(&mut self, vm: &mut Machine, slot: usize) {
        self.handle = None;
        let mut addr = FilePorts::dev(vm, slot).name.get();
        let mut bytes = Vec::new();
        loop {
            let b = vm.ram_read_byte(addr);
            if b == 0 {
                break;
            }
            bytes.push(b);
            match addr.checked_add(1) {
                Some(a) => addr = a,
                None => panic!("unterminated file name string"),
            }
        }
        let name = String::from_utf8_lossy(&bytes);
        self.name = if name.is_empty() {
            None
        } else {
            Some(sanitize(&name))
        };
    }

    fn stat(&mut self, vm: &mut Machine, slot: usize) {
        FilePorts::dev_mut(vm, slot).success.set(0);
        let len = Self::require_length(vm, slot, "stat");
        let path = self.require_name("stat").to_owned();
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                error!("stat {path:?}: {e}");
                return;
            }
        };
        let line = stat_line(&path.to_string_lossy(), &meta);
        if line.len() > usize::from(len) {
            return;
        }
        let addr = FilePorts::dev(vm, slot).stat.get();
        for (i, b) in line.iter().enumerate() {
            vm.ram_write_byte(addr.wrapping_add(i as u16), *b);
        }
        FilePorts::dev_mut(vm, slot).success.set(line.len() as u16);
    }

    fn delete(&mut self, vm: &mut Machine, slot: usize) {
        FilePorts::dev_mut(vm, slot).success.set(0);
        self.handle = None;
        let path = self.require_name("delete").to_owned();
        if let Err(e) = std::fs::remove_file(&path) {
            error!("delete {path:?}: {e}");
        }
    }

    fn read(&mut self, vm: &mut Machine, slot: usize) {
        FilePorts::dev_mut(vm, slot).success.set(0);
        let len = Self::require_length(vm, slot, "read");
        if matches!(self.handle, Some(Handle::Writer(_))) {
            panic!("file read after write; set the name again to re-open");
        }
        if self.handle.is_none() {
            let path = self.require_name("read").to_owned();
            let meta = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    error!("opening {path:?}: {e}");
                    return;
                }
            };
            let reader: Box<dyn Read + Send> = if meta.is_dir() {
                match dir_listing(&path) {
                    Ok(bytes) => Box::new(Cursor::new(bytes)),
                    Err(e) => {
                        error!("listing {path:?}: {e}");
                        return;
                    }
                }
            } else {
                match std::fs::File::open(&path) {
                    Ok(f) => Box::new(f),
                    Err(e) => {
                        error!("opening {path:?}: {e}");
                        return;
                    }
                }
            };
            self.handle = Some(Handle::Reader(reader));
        }

        let Some(Handle::Reader(r)) = self.handle.as_mut() else {
            unreachable!();
        };
        let mut buf = vec![0u8; usize::from(len)];
        let n = match r.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                error!("reading file: {e}");
                return;
            }
        };
        let addr = FilePorts::dev(vm, slot).read.get();
        for (i, b) in buf[..n].iter().enumerate() {
            vm.ram_write_byte(addr.wrapping_add(i as u16), *b);
        }
        FilePorts::dev_mut(vm, slot).success.set(n as u16);
    }

    fn write(&mut self, vm: &mut Machine, slot: usize) {
        FilePorts::dev_mut(vm, slot).success.set(0);
        let len = Self::require_length(vm, slot, "write");
        if matches!(self.handle, Some(Handle::Reader(_))) {
            panic!("file write after read; set the name again to re-open");
        }
        if self.handle.is_none() {
            let path = self.require_name("write").to_owned();
            let file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .append(self.append)
                .open(&path);
            match file {
                Ok(f) => self.handle = Some(Handle::Writer(f)),
                Err(e) => {
                    error!("opening {path:?}: {e}");
                    return;
                }
            }
        }

        let Some(Handle::Writer(f)) = self.handle.as_mut() else {
            unreachable!();
        };
        let addr = FilePorts::dev(vm, slot).write.get();
        let buf: Vec<u8> = (0..len)
            .map(|i| vm.ram_read_byte(addr.wrapping_add(i)))
            .collect();
        let n = match f.write(&buf) {
            Ok(n) => n,
            Err(e) => {
                error!("writing file: {e}");
                return;
            }
        };
        if n != buf.len() {
            error!("short write to file");
            return;
        }
        FilePorts::dev_mut(vm, slot).success.set(n as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_cleans_lexically() {
        assert_eq!(sanitize("a/b/../c"), PathBuf::from("a/c"));
        assert_eq!(sanitize("./x"), PathBuf::from("x"));
        assert_eq!(sanitize("a/./b"), PathBuf::from("a/b"));
    }

    #[test]
    #[should_panic(expected = "not relative")]
    fn sanitize_rejects_absolute() {
        sanitize("/etc/passwd");
    }

    #[test]
    #[should_panic(expected = "escapes the working directory")]
    fn sanitize_rejects_upward_escape() {
        sanitize("a/../../secret");
    }

    #[test]
    #[should_panic(expected = "before setting name")]
    fn read_without_name_is_a_program_bug() {
        let mut f = File::new();
        let mut m = Machine::new();
        let _ = m.reset(&[]);
        FilePorts::dev_mut(&mut m, 0).length.set(8);
        f.read(&mut m, 0);
    }

    #[test]
    #[should_panic(expected = "before setting length")]
    fn read_without_length_is_a_program_bug() {
        let mut f = File::new();
        let mut m = Machine::new();
        let _ = m.reset(&[]);
        f.read(&mut m, 0);
    }

    #[test]
    fn stat_line_formats() {
        let line = String::from_utf8(format!("{:04x} {}\n", 5, "t.out").into_bytes()).unwrap();
        assert_eq!(line, "0005 t.out\n");
    }

    #[test]
    fn decode_target_splits_slots() {
        assert_eq!(File::decode_target(0xa9), (0, 0x9));
        assert_eq!(File::decode_target(0xbd), (1, 0xd));
    }
}
