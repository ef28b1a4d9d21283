//! Address-to-symbol resolution for a live process
//!
//! Code ranges come from `/proc/<pid>/maps`; each mapped ELF file is parsed
//! once for its symbol table and segment layout. The target may load and
//! unload code at any time, so callers refresh before each reporting pass.

use crate::dwarf::SourceLines;
use crate::error::{ProfilerError, Result};
use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolves instruction and data addresses to readable names
pub trait SymbolResolver {
    /// Re-read the target's code ranges
    fn refresh_code_ranges(&mut self) -> Result<()>;

    /// Human-readable name of `address`; never fails
    fn decode(&self, address: u64) -> String;
}

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    /// Backing file, or a pseudo name such as `[heap]`; `None` when anonymous
    pub path: Option<String>,
}

impl MemoryMap {
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    /// Whether the backing path names a real file
    pub fn is_file_backed(&self) -> bool {
        self.path.as_deref().is_some_and(|path| path.starts_with('/'))
    }
}

/// Parse the contents of a maps file, skipping malformed lines
pub fn parse_maps(content: &str) -> Vec<MemoryMap> {
    content.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<MemoryMap> {
    // address perms offset dev inode [path]; the path may contain spaces
    let mut fields = line.splitn(6, ' ');
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields
        .next()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(|path| path.trim_end_matches(" (deleted)").to_string());

    Some(MemoryMap {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms: perms.to_string(),
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

#[derive(Debug, Clone)]
struct Symbol {
    address: u64,
    size: u64,
    name: String,
    global: bool,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    vaddr: u64,
    offset: u64,
    file_size: u64,
}

/// Symbol table and segment layout of one ELF object
#[derive(Debug)]
pub struct ModuleSymbols {
    /// Sorted by address, one name per address
    symbols: Vec<Symbol>,
    /// Every defined name, including aliases dropped from `symbols`
    names: HashMap<String, u64>,
    segments: Vec<Segment>,
}

impl ModuleSymbols {
    pub fn load(path: &Path) -> Result<Self> {
        let io_error = |source| ProfilerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_error)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(io_error)?;
        let object = object::File::parse(&*mmap).map_err(|source| ProfilerError::Object {
            path: path.to_path_buf(),
            source,
        })?;

        let symbols: Vec<Symbol> = object
            .symbols()
            .chain(object.dynamic_symbols())
            .filter(|sym| sym.is_definition())
            .filter(|sym| matches!(sym.kind(), SymbolKind::Text | SymbolKind::Data))
            .filter_map(|sym| {
                let name = sym.name().ok().filter(|name| !name.is_empty())?;
                Some(Symbol {
                    address: sym.address(),
                    size: sym.size(),
                    name: name.to_string(),
                    global: sym.is_global(),
                })
            })
            .collect();

        let segments = object
            .segments()
            .map(|segment| {
                let (offset, file_size) = segment.file_range();
                Segment {
                    vaddr: segment.address(),
                    offset,
                    file_size,
                }
            })
            .collect();

        Ok(Self::from_parts(symbols, segments))
    }

    fn from_parts(mut symbols: Vec<Symbol>, segments: Vec<Segment>) -> Self {
        let mut names = HashMap::with_capacity(symbols.len());
        let (global, local): (Vec<&Symbol>, Vec<&Symbol>) =
            symbols.iter().partition(|sym| sym.global);
        for sym in global.into_iter().chain(local) {
            names.entry(sym.name.clone()).or_insert(sym.address);
        }

        // glibc exports aliases such as `__pthread_mutex_unlock` at the same
        // address as the public name; decode to the public one
        symbols.sort_by_key(|sym| (sym.address, !sym.global, sym.name.starts_with('_')));
        symbols.dedup_by_key(|sym| sym.address);

        Self {
            symbols,
            names,
            segments,
        }
    }

    /// File-relative address of a named symbol
    pub fn address_of(&self, name: &str) -> Option<u64> {
        self.names.get(name).copied()
    }

    /// Symbol covering `vaddr` and the offset into it
    fn lookup(&self, vaddr: u64) -> Option<(&str, u64)> {
        let index = self.symbols.partition_point(|sym| sym.address <= vaddr);
        let sym = self.symbols.get(index.checked_sub(1)?)?;
        let offset = vaddr - sym.address;
        if sym.size != 0 && offset >= sym.size {
            return None;
        }
        Some((&sym.name, offset))
    }

    /// Difference between runtime and file-relative addresses for `map`
    fn load_bias(&self, map: &MemoryMap) -> u64 {
        let map_len = map.end - map.start;
        let segment = self.segments.iter().find(|seg| {
            seg.file_size > 0
                && seg.offset < map.offset + map_len
                && map.offset < seg.offset + seg.file_size
        });
        let file_base = map.start.wrapping_sub(map.offset);
        match segment {
            Some(seg) => file_base.wrapping_add(seg.offset).wrapping_sub(seg.vaddr),
            None => file_base,
        }
    }
}

#[derive(Debug)]
struct CodeRange {
    map: MemoryMap,
    bias: u64,
    module: Option<Arc<ModuleSymbols>>,
    file: Option<PathBuf>,
}

impl CodeRange {
    fn short_name(&self) -> &str {
        let path = self.map.path.as_deref().unwrap_or("anon");
        path.rsplit('/').next().unwrap_or(path)
    }
}

/// Symbol resolver for one process
#[derive(Debug)]
pub struct ProcessSymbols {
    pid: i32,
    source: bool,
    ranges: Vec<CodeRange>,
    modules: HashMap<String, Option<Arc<ModuleSymbols>>>,
    lines: HashMap<PathBuf, Option<SourceLines>>,
}

impl ProcessSymbols {
    /// Create a resolver and load the current code ranges
    pub fn new(pid: i32, source: bool) -> Result<Self> {
        let mut symbols = Self {
            pid,
            source,
            ranges: Vec::new(),
            modules: HashMap::new(),
            lines: HashMap::new(),
        };
        symbols.refresh_code_ranges()?;
        Ok(symbols)
    }

    /// Runtime address of `name`, searching libraries whose path contains one
    /// of `library_hints` first (in hint order), then every other mapping
    pub fn find_symbol(&self, name: &str, library_hints: &[String]) -> Option<u64> {
        let file_backed = || {
            self.ranges
                .iter()
                .filter_map(|range| range.module.as_ref().map(|module| (range, module)))
        };
        let resolve = |(range, module): (&CodeRange, &Arc<ModuleSymbols>)| {
            module
                .address_of(name)
                .map(|vaddr| range.bias.wrapping_add(vaddr))
        };

        for hint in library_hints {
            let found = file_backed()
                .filter(|(range, _)| range.short_name().contains(hint.as_str()))
                .find_map(resolve);
            if found.is_some() {
                return found;
            }
        }
        file_backed().find_map(resolve)
    }

    /// Path to open for a mapped file, through the target's root so that
    /// processes in other mount namespaces resolve too
    fn host_path(&self, path: &str) -> PathBuf {
        let rooted = PathBuf::from(format!("/proc/{}/root{}", self.pid, path));
        if rooted.exists() {
            rooted
        } else {
            PathBuf::from(path)
        }
    }

    fn module_for(&mut self, path: &str) -> Option<Arc<ModuleSymbols>> {
        if let Some(cached) = self.modules.get(path) {
            return cached.clone();
        }
        let module = match ModuleSymbols::load(&self.host_path(path)) {
            Ok(module) => Some(Arc::new(module)),
            Err(e) => {
                tracing::debug!("no symbols for {}: {}", path, e);
                None
            }
        };
        self.modules.insert(path.to_string(), module.clone());
        module
    }

    fn range_of(&self, address: u64) -> Option<&CodeRange> {
        let index = self.ranges.partition_point(|range| range.map.start <= address);
        let range = self.ranges.get(index.checked_sub(1)?)?;
        range.map.contains(address).then_some(range)
    }
}

impl SymbolResolver for ProcessSymbols {
    fn refresh_code_ranges(&mut self) -> Result<()> {
        let maps_path = PathBuf::from(format!("/proc/{}/maps", self.pid));
        let content = std::fs::read_to_string(&maps_path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ProfilerError::ProcessNotFound { pid: self.pid }
            } else {
                ProfilerError::Io {
                    path: maps_path.clone(),
                    source,
                }
            }
        })?;

        let mut ranges = Vec::new();
        for map in parse_maps(&content) {
            let (module, file) = if map.is_file_backed() {
                let path = map.path.clone().unwrap_or_default();
                (self.module_for(&path), Some(self.host_path(&path)))
            } else {
                (None, None)
            };
            let bias = module
                .as_ref()
                .map(|module| module.load_bias(&map))
                .unwrap_or(map.start);
            ranges.push(CodeRange {
                map,
                bias,
                module,
                file,
            });
        }
        ranges.sort_by_key(|range| range.map.start);

        if self.source {
            for file in ranges.iter().filter_map(|range| range.file.as_ref()) {
                if !self.lines.contains_key(file) {
                    let lines = SourceLines::load(file)
                        .map_err(|e| tracing::debug!("no line info for {}: {}", file.display(), e))
                        .ok();
                    self.lines.insert(file.clone(), lines);
                }
            }
        }

        tracing::debug!(pid = self.pid, ranges = ranges.len(), "refreshed code ranges");
        self.ranges = ranges;
        Ok(())
    }

    fn decode(&self, address: u64) -> String {
        let Some(range) = self.range_of(address) else {
            return "[unknown]".to_string();
        };
        let vaddr = address.wrapping_sub(range.bias);

        let symbol = range
            .module
            .as_ref()
            .and_then(|module| module.lookup(vaddr));
        let mut text = match symbol {
            Some((name, 0)) => name.to_string(),
            Some((name, offset)) => format!("{}+0x{:x}", name, offset),
            None => format!("[{}]+0x{:x}", range.short_name(), vaddr),
        };

        let location = range
            .file
            .as_ref()
            .and_then(|file| self.lines.get(file))
            .and_then(Option::as_ref)
            .and_then(|lines| lines.lookup(vaddr));
        if let Some(location) = location {
            text.push_str(&format!(" at {}", location));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HookSymbols;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:01 1234                       /usr/bin/target
55d0c0a02000-55d0c0a05000 r-xp 00002000 08:01 1234                       /usr/bin/target
55d0c1000000-55d0c1021000 rw-p 00000000 00:00 0                          [heap]
7f0000000000-7f0000001000 rw-p 00000000 00:00 0
7f0000100000-7f0000200000 r-xp 00010000 08:01 99                         /opt/my lib/libx.so (deleted)
";

    #[test]
    fn test_parse_maps_fields() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 5);
        assert_eq!(maps[1].start, 0x55d0c0a02000);
        assert_eq!(maps[1].end, 0x55d0c0a05000);
        assert_eq!(maps[1].offset, 0x2000);
        assert!(maps[1].is_executable());
        assert!(!maps[0].is_executable());
        assert_eq!(maps[1].path.as_deref(), Some("/usr/bin/target"));
    }

    #[test]
    fn test_parse_maps_pseudo_and_anonymous() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps[2].path.as_deref(), Some("[heap]"));
        assert!(!maps[2].is_file_backed());
        assert_eq!(maps[3].path, None);
    }

    #[test]
    fn test_parse_maps_path_with_spaces_and_deleted() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps[4].path.as_deref(), Some("/opt/my lib/libx.so"));
        assert!(maps[4].is_file_backed());
    }

    #[test]
    fn test_parse_maps_skips_garbage() {
        assert!(parse_maps("not a maps line\n\nzz-yy r-xp 0 0 0\n").is_empty());
    }

    #[test]
    fn test_load_bias_shared_object_layout() {
        let module = ModuleSymbols::from_parts(
            Vec::new(),
            vec![
                Segment {
                    vaddr: 0,
                    offset: 0,
                    file_size: 0x1000,
                },
                Segment {
                    vaddr: 0x1000,
                    offset: 0x1000,
                    file_size: 0x3000,
                },
            ],
        );
        let map = MemoryMap {
            start: 0x7f0000001000,
            end: 0x7f0000004000,
            perms: "r-xp".to_string(),
            offset: 0x1000,
            path: Some("/lib/libfoo.so".to_string()),
        };
        assert_eq!(module.load_bias(&map), 0x7f0000000000);
    }

    #[test]
    fn test_load_bias_non_pie_executable() {
        let module = ModuleSymbols::from_parts(
            Vec::new(),
            vec![Segment {
                vaddr: 0x400000,
                offset: 0,
                file_size: 0x2000,
            }],
        );
        let map = MemoryMap {
            start: 0x400000,
            end: 0x402000,
            perms: "r-xp".to_string(),
            offset: 0,
            path: Some("/usr/bin/static".to_string()),
        };
        assert_eq!(module.load_bias(&map), 0);
    }

    #[test]
    fn test_module_lookup_respects_symbol_size() {
        let module = ModuleSymbols::from_parts(
            vec![symbol(0x100, 0x20, "alpha", true), symbol(0x200, 0, "beta", true)],
            Vec::new(),
        );
        assert_eq!(module.lookup(0x100), Some(("alpha", 0)));
        assert_eq!(module.lookup(0x110), Some(("alpha", 0x10)));
        assert_eq!(module.lookup(0x150), None);
        assert_eq!(module.lookup(0x250), Some(("beta", 0x50)));
        assert_eq!(module.lookup(0x50), None);
        assert_eq!(module.address_of("beta"), Some(0x200));
    }

    fn symbol(address: u64, size: u64, name: &str, global: bool) -> Symbol {
        Symbol {
            address,
            size,
            name: name.to_string(),
            global,
        }
    }

    #[test]
    fn test_aliases_at_one_address_all_resolve() {
        let module = ModuleSymbols::from_parts(
            vec![
                symbol(0x300, 0x40, "__pthread_mutex_unlock", true),
                symbol(0x300, 0x40, "pthread_mutex_unlock", true),
                symbol(0x300, 0x40, "unlock_local", false),
                symbol(0x100, 0x40, "pthread_mutex_lock", true),
            ],
            Vec::new(),
        );
        assert_eq!(module.address_of("pthread_mutex_unlock"), Some(0x300));
        assert_eq!(module.address_of("__pthread_mutex_unlock"), Some(0x300));
        assert_eq!(module.address_of("unlock_local"), Some(0x300));
        assert_eq!(module.address_of("pthread_mutex_lock"), Some(0x100));
        assert_eq!(module.lookup(0x308), Some(("pthread_mutex_unlock", 8)));
    }

    #[test]
    fn test_global_name_preferred_over_local() {
        let module = ModuleSymbols::from_parts(
            vec![symbol(0x10, 0, "helper", false), symbol(0x10, 0, "_exported", true)],
            Vec::new(),
        );
        assert_eq!(module.lookup(0x10), Some(("_exported", 0)));
    }

    #[test]
    fn test_default_hooks_resolve_in_own_process() {
        let symbols = ProcessSymbols::new(std::process::id() as i32, false).unwrap();
        let hooks = HookSymbols::default();
        for name in [&hooks.init, &hooks.lock, &hooks.unlock] {
            assert!(
                symbols.find_symbol(name, &hooks.libraries).is_some(),
                "{} not resolved",
                name
            );
        }
    }

    #[inline(never)]
    fn decode_marker_function() -> u64 {
        std::hint::black_box(7)
    }

    #[test]
    fn test_decode_own_function() {
        let symbols = ProcessSymbols::new(std::process::id() as i32, false).unwrap();
        let address = decode_marker_function as usize as u64;
        assert_eq!(decode_marker_function(), 7);
        let decoded = symbols.decode(address);
        assert!(
            decoded.contains("decode_marker_function"),
            "unexpected decode: {}",
            decoded
        );
    }

    #[test]
    fn test_decode_unmapped_address() {
        let symbols = ProcessSymbols::new(std::process::id() as i32, false).unwrap();
        assert_eq!(symbols.decode(0x10), "[unknown]");
    }

    #[test]
    fn test_missing_process() {
        assert!(matches!(
            ProcessSymbols::new(i32::MAX, false),
            Err(ProfilerError::ProcessNotFound { .. })
        ));
    }
}
