//! The module abstraction shared between the dump reader and the symbol
//! machinery.

use std::borrow::Cow;

use debugid::{CodeId, DebugId};

/// An executable or shared library that was loaded into the crashed process.
///
/// Symbol lookup only needs identity, not the raw minidump record, so this
/// trait is what crosses the crate boundary. `debris-symbols` resolves a
/// module's symbol file from `debug_file` + `debug_identifier`.
pub trait Module {
    /// The address this image was mapped at.
    fn base_address(&self) -> u64;
    /// The size of the mapped image in bytes.
    fn size(&self) -> u64;
    /// The path or file name the image was loaded from.
    fn code_file(&self) -> Cow<'_, str>;
    /// An identifier distinguishing builds of the same `code_file`, when one
    /// can be derived (PE timestamp+size, ELF build id, Mach-O UUID).
    fn code_identifier(&self) -> Option<CodeId>;
    /// The file carrying this module's debug information, when it is known
    /// to differ from (or equal) `code_file`.
    fn debug_file(&self) -> Option<Cow<'_, str>>;
    /// The identifier matching `debug_file` to this exact build.
    fn debug_identifier(&self) -> Option<DebugId>;
    /// A human-readable version string, if the image carries one.
    fn version(&self) -> Option<Cow<'_, str>>;
}

/// Returns the final path component of `path`, for either separator style.
///
/// Minidump module names come from foreign systems, so `std::path` rules
/// don't apply; a Windows dump processed on Linux still has `\` separators.
pub fn basename(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        None => path,
        Some(index) => &path[(index + 1)..],
    }
}

#[cfg(test)]
mod test {
    use super::basename;

    #[test]
    fn test_basename() {
        assert_eq!(basename("c:\\foo\\bar\\app.pdb"), "app.pdb");
        assert_eq!(basename("/usr/lib/libfoo.so"), "libfoo.so");
        assert_eq!(basename("bare"), "bare");
        assert_eq!(basename(""), "");
    }
}
