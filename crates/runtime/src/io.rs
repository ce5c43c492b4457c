//! Host I/O hooks.
//!
//! The context owns one `Io` table shared (via `Rc`) with the builtins
//! that perform I/O. Defaults go straight to the process's stdout and
//! filesystem; embedders replace them to capture output or virtualise
//! files (imports read through `read_file` too).

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

pub type StdoutWriteFn = Rc<dyn Fn(&[u8]) -> usize>;
pub type ReadFileFn = Rc<dyn Fn(&str) -> Option<String>>;
pub type WriteFileFn = Rc<dyn Fn(&str, &[u8]) -> usize>;

pub struct Io {
    stdout_write: RefCell<StdoutWriteFn>,
    read_file: RefCell<Option<ReadFileFn>>,
    write_file: RefCell<Option<WriteFileFn>>,
}

impl Default for Io {
    fn default() -> Self {
        Io {
            stdout_write: RefCell::new(Rc::new(|bytes: &[u8]| {
                let mut stdout = std::io::stdout().lock();
                match stdout.write_all(bytes).and_then(|_| stdout.flush()) {
                    Ok(()) => bytes.len(),
                    Err(_) => 0,
                }
            })),
            read_file: RefCell::new(Some(Rc::new(|path: &str| {
                std::fs::read_to_string(path).ok()
            }))),
            write_file: RefCell::new(Some(Rc::new(|path: &str, bytes: &[u8]| {
                match std::fs::write(path, bytes) {
                    Ok(()) => bytes.len(),
                    Err(_) => 0,
                }
            }))),
        }
    }
}

impl Io {
    pub fn set_stdout_write(&self, f: StdoutWriteFn) {
        *self.stdout_write.borrow_mut() = f;
    }

    pub fn set_read_file(&self, f: Option<ReadFileFn>) {
        *self.read_file.borrow_mut() = f;
    }

    pub fn set_write_file(&self, f: Option<WriteFileFn>) {
        *self.write_file.borrow_mut() = f;
    }

    pub fn write_stdout(&self, bytes: &[u8]) -> usize {
        let hook = self.stdout_write.borrow().clone();
        hook(bytes)
    }

    pub fn read_file_hook(&self) -> Option<ReadFileFn> {
        self.read_file.borrow().clone()
    }

    pub fn write_file_hook(&self) -> Option<WriteFileFn> {
        self.write_file.borrow().clone()
    }
}
