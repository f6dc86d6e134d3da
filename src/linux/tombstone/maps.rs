use {
    super::super::{Pid, errors::WriterError},
    crate::serializers::serialize_hex,
    procfs_core::{
        FromRead,
        process::{MMPermissions, MMapPath, MemoryMap, MemoryMaps},
    },
};

/// One line of /proc/$pid/maps
#[derive(Debug, serde::Serialize)]
pub struct Mapping {
    #[serde(serialize_with = "serialize_hex")]
    pub start: u64,
    #[serde(serialize_with = "serialize_hex")]
    pub end: u64,
    pub perms: String,
    #[serde(serialize_with = "serialize_hex")]
    pub offset: u64,
    pub inode: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Mapping {
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end).contains(&address)
    }
}

impl From<MemoryMap> for Mapping {
    fn from(map: MemoryMap) -> Self {
        let perms = [
            (MMPermissions::READ, 'r'),
            (MMPermissions::WRITE, 'w'),
            (MMPermissions::EXECUTE, 'x'),
        ]
        .into_iter()
        .map(|(flag, c)| if map.perms.contains(flag) { c } else { '-' })
        .chain(std::iter::once(
            if map.perms.contains(MMPermissions::SHARED) {
                's'
            } else {
                'p'
            },
        ))
        .collect();

        let name = match map.pathname {
            MMapPath::Path(path) => Some(path.display().to_string()),
            MMapPath::Heap => Some("[heap]".to_owned()),
            MMapPath::Stack => Some("[stack]".to_owned()),
            MMapPath::TStack(tid) => Some(format!("[stack:{tid}]")),
            MMapPath::Vdso => Some("[vdso]".to_owned()),
            MMapPath::Vvar => Some("[vvar]".to_owned()),
            MMapPath::Vsyscall => Some("[vsyscall]".to_owned()),
            MMapPath::Anonymous => None,
            MMapPath::Other(other) => Some(other),
            other => Some(format!("{other:?}")),
        };

        Self {
            start: map.address.0,
            end: map.address.1,
            perms,
            offset: map.offset,
            inode: map.inode,
            name,
        }
    }
}

pub fn read_mappings(pid: Pid) -> Result<Vec<Mapping>, WriterError> {
    let maps_path = format!("/proc/{pid}/maps");
    let maps_file =
        std::fs::File::open(&maps_path).map_err(|e| WriterError::IOError(maps_path, e))?;

    let maps = MemoryMaps::from_read(maps_file).map_err(WriterError::ReadMapsFailed)?;

    Ok(maps.into_iter().map(Mapping::from).collect())
}
