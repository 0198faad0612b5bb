//! PE export resolution for modules loaded in the target.
//!
//! Used when a function has no cached offset and no workable byte
//! signature: walk the module's export directory in-place and build a
//! name → address table from the three parallel RVA arrays.

pub mod layout;

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::process::ProcessMemory;

use layout::pe;

#[derive(Debug, Clone, Copy)]
struct ExportDirectory {
    module_base: u64,
    function_count: i32,
    name_count: i32,
    functions_rva: u32,
    names_rva: u32,
    ordinals_rva: u32,
}

impl ExportDirectory {
    fn name_rva_addr(&self, index: usize) -> u64 {
        self.module_base + self.names_rva as u64 + (index as u64 * pe::NAME_RVA_SIZE)
    }

    fn ordinal_addr(&self, index: usize) -> u64 {
        self.module_base + self.ordinals_rva as u64 + (index as u64 * pe::ORDINAL_SIZE)
    }

    fn function_rva_addr(&self, ordinal: u16) -> u64 {
        self.module_base + self.functions_rva as u64 + (ordinal as u64 * pe::FUNCTION_RVA_SIZE)
    }
}

/// Parse DOS and PE headers down to the export directory.
fn read_export_directory<P: ProcessMemory>(
    process: &P,
    module_base: u64,
) -> Result<ExportDirectory> {
    let e_lfanew = process.read_u32(module_base + pe::E_LFANEW_OFFSET)? as u64;
    let pe_base = module_base + e_lfanew;

    let signature = process.read_u32(pe_base)?;
    if signature != pe::PE_SIGNATURE {
        return Err(Error::InvalidImage {
            address: module_base,
            message: format!("bad PE signature {signature:#x}"),
        });
    }

    let optional_base = pe_base + pe::OPTIONAL_HEADER_OFFSET;
    let magic = process.read_u32(optional_base)? & 0xFFFF;
    let data_dir_offset = match magic {
        pe::MAGIC_PE32 => pe::DATA_DIRECTORY_OFFSET_32,
        pe::MAGIC_PE32_PLUS => pe::DATA_DIRECTORY_OFFSET_64,
        other => {
            return Err(Error::InvalidImage {
                address: module_base,
                message: format!("unknown optional-header magic {other:#x}"),
            });
        }
    };

    // data directory slot 0 is the export directory
    let export_rva = process.read_u32(optional_base + data_dir_offset)? as u64;
    if export_rva == 0 {
        return Err(Error::InvalidImage {
            address: module_base,
            message: "no export directory".to_string(),
        });
    }

    let dir_base = module_base + export_rva;
    let function_count = process.read_i32(dir_base + pe::EXPORT_FUNCTION_COUNT_OFFSET)?;
    let name_count = process.read_i32(dir_base + pe::EXPORT_NAME_COUNT_OFFSET)?;

    // A negative count means corrupt data or a mismatched architecture.
    if function_count < 0 || name_count < 0 {
        return Err(Error::NegativeExportCounts {
            functions: function_count,
            names: name_count,
        });
    }

    Ok(ExportDirectory {
        module_base,
        function_count,
        name_count,
        functions_rva: process.read_u32(dir_base + pe::EXPORT_FUNCTIONS_RVA_OFFSET)?,
        names_rva: process.read_u32(dir_base + pe::EXPORT_NAMES_RVA_OFFSET)?,
        ordinals_rva: process.read_u32(dir_base + pe::EXPORT_ORDINALS_RVA_OFFSET)?,
    })
}

fn read_export_name<P: ProcessMemory>(process: &P, address: u64) -> Option<String> {
    let bytes = process.read_bytes(address, pe::NAME_READ_SIZE).ok()?;
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    if len == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes[..len]).into_owned())
}

fn export_address<P: ProcessMemory>(
    process: &P,
    dir: &ExportDirectory,
    index: usize,
) -> Result<u64> {
    let ordinal = process.read_u32(dir.ordinal_addr(index))? as u16;
    let function_rva = process.read_u32(dir.function_rva_addr(ordinal))?;
    Ok(dir.module_base + function_rva as u64)
}

/// Resolve a single export by name; stops at the first match.
pub fn resolve_export<P: ProcessMemory>(
    process: &P,
    module_base: u64,
    export_name: &str,
) -> Result<u64> {
    let dir = read_export_directory(process, module_base)?;
    let names_to_check = (dir.name_count as usize).min(pe::MAX_EXPORT_NAMES);

    for index in 0..names_to_check {
        let name_rva = process.read_u32(dir.name_rva_addr(index))?;
        if name_rva == 0 {
            continue;
        }
        let Some(name) = read_export_name(process, module_base + name_rva as u64) else {
            continue;
        };
        if name == export_name {
            let address = export_address(process, &dir, index)?;
            debug!("Resolved export {} -> {:#x}", export_name, address);
            return Ok(address);
        }
    }

    Err(Error::ExportNotFound(export_name.to_string()))
}

/// Build the full name → address table for a module.
pub fn export_table<P: ProcessMemory>(
    process: &P,
    module_base: u64,
) -> Result<HashMap<String, u64>> {
    let dir = read_export_directory(process, module_base)?;
    let names_to_check = (dir.name_count as usize).min(pe::MAX_EXPORT_NAMES);
    let mut result = HashMap::with_capacity(names_to_check);

    for index in 0..names_to_check {
        let name_rva = process.read_u32(dir.name_rva_addr(index))?;
        if name_rva == 0 {
            continue;
        }
        let Some(name) = read_export_name(process, module_base + name_rva as u64) else {
            continue;
        };
        let address = export_address(process, &dir, index)?;
        result.insert(name, address);
    }

    debug!(
        "Export table: {} names of {} declared ({} functions)",
        result.len(),
        dir.name_count,
        dir.function_count
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockProcess, MockProcessBuilder};

    const BASE: u64 = 0x1_4000_0000;

    /// Lay out a minimal 64-bit image with two named exports.
    fn synthetic_module() -> MockProcess {
        let mut image = vec![0u8; 0x400];

        // DOS header: MZ + e_lfanew
        image[0] = b'M';
        image[1] = b'Z';
        image[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());

        // PE signature + optional header magic (PE32+)
        image[0x80..0x84].copy_from_slice(&pe::PE_SIGNATURE.to_le_bytes());
        let opt = 0x80 + pe::OPTIONAL_HEADER_OFFSET as usize;
        image[opt..opt + 2].copy_from_slice(&(pe::MAGIC_PE32_PLUS as u16).to_le_bytes());

        // export directory RVA in data directory slot 0
        let dd = opt + pe::DATA_DIRECTORY_OFFSET_64 as usize;
        image[dd..dd + 4].copy_from_slice(&0x200u32.to_le_bytes());

        // export directory
        let dir = 0x200;
        let put_u32 = |image: &mut Vec<u8>, at: usize, v: u32| {
            image[at..at + 4].copy_from_slice(&v.to_le_bytes());
        };
        put_u32(&mut image, dir + pe::EXPORT_FUNCTION_COUNT_OFFSET as usize, 2);
        put_u32(&mut image, dir + pe::EXPORT_NAME_COUNT_OFFSET as usize, 2);
        put_u32(&mut image, dir + pe::EXPORT_FUNCTIONS_RVA_OFFSET as usize, 0x300);
        put_u32(&mut image, dir + pe::EXPORT_NAMES_RVA_OFFSET as usize, 0x320);
        put_u32(&mut image, dir + pe::EXPORT_ORDINALS_RVA_OFFSET as usize, 0x340);

        // functions by ordinal
        put_u32(&mut image, 0x300, 0x1000);
        put_u32(&mut image, 0x304, 0x2000);
        // name RVAs
        put_u32(&mut image, 0x320, 0x360);
        put_u32(&mut image, 0x324, 0x370);
        // ordinals (u16)
        image[0x340..0x342].copy_from_slice(&0u16.to_le_bytes());
        image[0x342..0x344].copy_from_slice(&1u16.to_le_bytes());
        // names
        image[0x360..0x366].copy_from_slice(b"il2cpp");
        image[0x370..0x37B].copy_from_slice(b"game_update");

        MockProcessBuilder::new().region(BASE, image).build()
    }

    #[test]
    fn resolves_export_by_name() {
        let process = synthetic_module();
        assert_eq!(
            resolve_export(&process, BASE, "il2cpp").unwrap(),
            BASE + 0x1000
        );
        assert_eq!(
            resolve_export(&process, BASE, "game_update").unwrap(),
            BASE + 0x2000
        );
    }

    #[test]
    fn missing_export_is_not_found() {
        let process = synthetic_module();
        let err = resolve_export(&process, BASE, "nonexistent").unwrap_err();
        assert!(matches!(err, Error::ExportNotFound(_)));
    }

    #[test]
    fn full_table_contains_all_names() {
        let process = synthetic_module();
        let table = export_table(&process, BASE).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table["il2cpp"], BASE + 0x1000);
        assert_eq!(table["game_update"], BASE + 0x2000);
    }

    #[test]
    fn bad_signature_is_invalid_image() {
        let mut image = vec![0u8; 0x100];
        image[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        // no PE magic at 0x80
        let process = MockProcessBuilder::new().region(BASE, image).build();

        let err = resolve_export(&process, BASE, "whatever").unwrap_err();
        assert!(matches!(err, Error::InvalidImage { .. }));
    }

    #[test]
    fn negative_counts_are_rejected() {
        let process = synthetic_module();
        // corrupt the function count in place
        process
            .write_bytes(
                BASE + 0x200 + pe::EXPORT_FUNCTION_COUNT_OFFSET,
                &(-1i32).to_le_bytes(),
            )
            .unwrap();

        let err = resolve_export(&process, BASE, "il2cpp").unwrap_err();
        assert!(matches!(err, Error::NegativeExportCounts { .. }));
    }
}
