use std::{
    borrow::{self, Cow},
    fs,
    ops::Range,
    path::Path,
};

use gimli::{AttributeValue, DwTag, EndianSlice, RunTimeEndian};
use object::{Object, ObjectKind, ObjectSection};
use tracing::{debug, warn};

use crate::error::Result;

type Reader<'a> = EndianSlice<'a, RunTimeEndian>;

/// Distance between the live `rbp` and the frame base that `DW_OP_fbreg`
/// offsets are relative to, assuming the usual `push rbp; mov rbp, rsp`
/// prologue (saved rbp + return address). Not derived from `DW_AT_frame_base`.
pub const FRAME_BASE_ADJUSTMENT: u64 = 0x10;

/// A subprogram owning the half-open address range `[low_pc, high_pc)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
}

impl FunctionSymbol {
    pub fn contains(&self, addr: u64) -> bool {
        (self.low_pc..self.high_pc).contains(&addr)
    }

    pub fn len(&self) -> u64 {
        self.high_pc.saturating_sub(self.low_pc)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn rebased(self, bias: u64) -> FunctionSymbol {
        FunctionSymbol {
            low_pc: self.low_pc.wrapping_add(bias),
            high_pc: self.high_pc.wrapping_add(bias),
            ..self
        }
    }
}

/// A variable found under a function, with a rule to find its storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub name: String,
    /// `None` when the location is anything but a constant frame-base offset.
    pub frame_offset: Option<i64>,
}

impl LocalVariable {
    /// Storage address for the frame whose saved frame pointer is `rbp`.
    pub fn address(&self, rbp: u64) -> Option<u64> {
        self.frame_offset.map(|offset| {
            rbp.wrapping_add(FRAME_BASE_ADJUSTMENT)
                .wrapping_add_signed(offset)
        })
    }
}

/// How a variable entry says its value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// `DW_OP_fbreg <offset>`.
    FrameOffset(i64),
    /// Registers, absolute addresses, location lists, composite pieces.
    Other,
}

/// Owned copy of one debugging information entry and its subtree, keeping
/// only what the queries below look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Die {
    pub tag: DwTag,
    pub name: Option<String>,
    pub pc_range: Option<Range<u64>>,
    pub location: Option<Location>,
    pub children: Vec<Die>,
}

impl Die {
    pub fn new(tag: DwTag) -> Die {
        Die {
            tag,
            name: None,
            pc_range: None,
            location: None,
            children: Vec::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Die {
        self.name = Some(name.to_owned());
        self
    }

    pub fn with_range(mut self, low_pc: u64, high_pc: u64) -> Die {
        self.pc_range = Some(low_pc..high_pc);
        self
    }

    pub fn with_location(mut self, location: Location) -> Die {
        self.location = Some(location);
        self
    }

    pub fn with_children(mut self, children: Vec<Die>) -> Die {
        self.children = children;
        self
    }

    fn as_function(&self) -> Option<FunctionSymbol> {
        if self.tag != gimli::DW_TAG_subprogram {
            return None;
        }
        let name = self.name.as_ref()?;
        let range = self.pc_range.as_ref()?;
        Some(FunctionSymbol {
            name: name.clone(),
            low_pc: range.start,
            high_pc: range.end,
        })
    }

    fn as_variable(&self) -> Option<LocalVariable> {
        if self.tag != gimli::DW_TAG_variable {
            return None;
        }
        let location = self.location?;
        Some(LocalVariable {
            name: self.name.clone()?,
            frame_offset: match location {
                Location::FrameOffset(offset) => Some(offset),
                Location::Other => None,
            },
        })
    }
}

/// Whether the variable walk for `function` looks below `die`: everything is
/// visited except subtrees rooted at some other subprogram.
fn descends_into(die: &Die, function: &str) -> bool {
    !(die.tag == gimli::DW_TAG_subprogram && die.name.as_deref() != Some(function))
}

/// Symbol and variable lookups over a binary's DWARF.
///
/// Addresses are file addresses as recorded in the debug sections; callers
/// translate runtime addresses for position independent executables.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    units: Vec<Die>,
    position_independent: bool,
}

impl DebugInfo {
    pub fn open(path: &Path) -> Result<DebugInfo> {
        let file = fs::File::open(path)?;
        // SAFETY: the mapping is dropped before this function returns and the
        // binary is not expected to change while it is parsed.
        let mmap = unsafe { memmap::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let dwarf = load_dwarf(&object)?;
        let dwarf = borrow_section(&dwarf, endian);

        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            let unit = dwarf.unit(header)?;
            let mut tree = unit.entries_tree(None)?;
            units.push(read_die(&dwarf, &unit, tree.root()?)?);
        }
        if units.is_empty() {
            warn!(path = %path.display(), "binary has no DWARF compilation units");
        }
        debug!(path = %path.display(), units = units.len(), "loaded debug info");

        Ok(DebugInfo {
            units,
            position_independent: object.kind() == ObjectKind::Dynamic,
        })
    }

    /// Builds the resolver from already decoded compilation unit roots.
    pub fn from_units(units: Vec<Die>, position_independent: bool) -> DebugInfo {
        DebugInfo {
            units,
            position_independent,
        }
    }

    /// Position independent images are mapped at a load bias that has to be
    /// added to every address found here.
    pub fn is_position_independent(&self) -> bool {
        self.position_independent
    }

    /// The subprogram directly under a compilation unit whose range holds
    /// `addr`. Nested and inlined subprograms are not considered.
    pub fn function_containing(&self, addr: u64) -> Option<FunctionSymbol> {
        self.units
            .iter()
            .flat_map(|unit| unit.children.iter())
            .filter_map(Die::as_function)
            .find(|function| function.contains(addr))
    }

    /// Every named top-level subprogram with an address range, by address.
    pub fn functions(&self) -> Vec<FunctionSymbol> {
        let mut functions: Vec<_> = self
            .units
            .iter()
            .flat_map(|unit| unit.children.iter())
            .filter_map(Die::as_function)
            .collect();
        functions.sort_by_key(|function| function.low_pc);
        functions
    }

    /// Variables visible from `function`, in depth-first order.
    ///
    /// Includes variables of nested lexical blocks and file scope variables;
    /// only subtrees of other subprograms are skipped.
    pub fn locals_of(&self, function: &str) -> Vec<LocalVariable> {
        let mut locals = Vec::new();
        for unit in &self.units {
            let mut stack = vec![unit];
            while let Some(die) = stack.pop() {
                locals.extend(die.as_variable());
                if descends_into(die, function) {
                    stack.extend(die.children.iter().rev());
                }
            }
        }
        locals
    }
}

fn load_dwarf<'data>(object: &object::File<'data>) -> Result<gimli::Dwarf<Cow<'data, [u8]>>> {
    let load_section = |id: gimli::SectionId| -> std::result::Result<Cow<'data, [u8]>, gimli::Error> {
        match object.section_by_name(id.name()) {
            Some(ref section) => Ok(section
                .uncompressed_data()
                .unwrap_or(borrow::Cow::Borrowed(&[][..]))),
            None => Ok(borrow::Cow::Borrowed(&[][..])),
        }
    };

    Ok(gimli::Dwarf::load(&load_section)?)
}

fn borrow_section<'a>(
    dwarf: &'a gimli::Dwarf<Cow<'a, [u8]>>,
    endian: RunTimeEndian,
) -> gimli::Dwarf<Reader<'a>> {
    dwarf.borrow(|section| EndianSlice::new(section, endian))
}

fn read_die<'a>(
    dwarf: &gimli::Dwarf<Reader<'a>>,
    unit: &gimli::Unit<Reader<'a>>,
    node: gimli::EntriesTreeNode<'_, '_, '_, Reader<'a>>,
) -> Result<Die> {
    let entry = node.entry();
    let mut die = Die::new(entry.tag());

    if let Some(name) = entry.attr_value(gimli::DW_AT_name)? {
        die.name = dwarf
            .attr_string(unit, name)
            .ok()
            .map(|name| name.to_string_lossy().into_owned());
    }
    die.pc_range = pc_range(dwarf, unit, entry)?;
    if let Some(location) = entry.attr_value(gimli::DW_AT_location)? {
        die.location = Some(frame_location(unit, location));
    }

    let mut children = node.children();
    while let Some(child) = children.next()? {
        die.children.push(read_die(dwarf, unit, child)?);
    }
    Ok(die)
}

fn pc_range<'a>(
    dwarf: &gimli::Dwarf<Reader<'a>>,
    unit: &gimli::Unit<Reader<'a>>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, Reader<'a>>,
) -> Result<Option<Range<u64>>> {
    let low_pc = match entry.attr_value(gimli::DW_AT_low_pc)? {
        Some(value) => dwarf.attr_address(unit, value)?,
        None => None,
    };
    let Some(low_pc) = low_pc else {
        return Ok(None);
    };

    // DWARF 4+ usually stores high_pc as a length from low_pc
    let high_pc = match entry.attr_value(gimli::DW_AT_high_pc)? {
        Some(value) => match dwarf.attr_address(unit, value.clone())? {
            Some(high_pc) => high_pc,
            None => match value.udata_value() {
                Some(len) => low_pc.wrapping_add(len),
                None => return Ok(None),
            },
        },
        None => return Ok(None),
    };

    Ok(Some(low_pc..high_pc))
}

fn frame_location(unit: &gimli::Unit<Reader<'_>>, value: AttributeValue<Reader<'_>>) -> Location {
    let Some(expression) = value.exprloc_value() else {
        return Location::Other;
    };
    match expression.operations(unit.encoding()).next() {
        Ok(Some(gimli::Operation::FrameOffset { offset })) => Location::FrameOffset(offset),
        _ => Location::Other,
    }
}
