//! Archive header and TOC serialization.

use std::io::{Read, Write};

use anyhow::{bail, format_err, Error};

use pgarch_api_types::{
    ArchiveFormat, CatalogId, CompressionAlgorithm, CompressionSpec, ObjectClass, Section,
};

use crate::codec::{map_read_error, map_write_error, Codec};
use crate::error::ArchiveError;
use crate::file_formats::*;
use crate::toc::{FormatExtra, Toc, TocEntry};

/// Version string recorded as the dumping program.
pub const DUMPER_VERSION: &str = concat!("pgarch ", env!("CARGO_PKG_VERSION"));

/// Archive header, written at the start of custom archives and of the
/// `toc.dat` member of directory and tar archives.
#[derive(Clone, Debug)]
pub struct ArchiveHeader {
    pub major: u8,
    pub minor: u8,
    pub rev: u8,
    pub int_size: usize,
    pub off_size: usize,
    pub format: ArchiveFormat,
    pub compression: CompressionSpec,
    /// Creation time, seconds since the epoch. `0` when unknown.
    pub create_date: i64,
    pub dbname: String,
    pub server_version: String,
    pub dumper_version: String,
}

impl ArchiveHeader {
    /// Header of a new archive, at the current version.
    pub fn new(format: ArchiveFormat, compression: CompressionSpec) -> Self {
        Self {
            major: K_VERS_MAJOR,
            minor: K_VERS_MINOR,
            rev: K_VERS_REV,
            int_size: DEFAULT_INT_SIZE,
            off_size: DEFAULT_OFF_SIZE,
            format,
            compression,
            create_date: proxmox_time::epoch_i64(),
            dbname: String::new(),
            server_version: String::new(),
            dumper_version: DUMPER_VERSION.to_string(),
        }
    }

    pub fn version(&self) -> u32 {
        make_archive_version(self.major, self.minor, self.rev)
    }

    pub fn codec(&self) -> Codec {
        Codec {
            version: self.version(),
            int_size: self.int_size,
            off_size: self.off_size,
        }
    }

    /// `1.15-0` style version string.
    pub fn version_string(&self) -> String {
        format!("{}.{}-{}", self.major, self.minor, self.rev)
    }

    /// Write the header. Always uses the current layout.
    pub fn write(&self, writer: &mut dyn Write) -> Result<(), Error> {
        let codec = self.codec();

        writer.write_all(ARCHIVE_MAGIC).map_err(map_write_error)?;
        codec.write_byte(writer, self.major)?;
        codec.write_byte(writer, self.minor)?;
        codec.write_byte(writer, self.rev)?;
        codec.write_byte(writer, self.int_size as u8)?;
        codec.write_byte(writer, self.off_size as u8)?;
        codec.write_byte(writer, self.format.tag())?;
        codec.write_byte(writer, self.compression.algorithm.code())?;
        codec.write_int(writer, self.compression.level)?;

        let tm = proxmox_time::localtime(self.create_date)?;
        for value in [
            tm.tm_sec,
            tm.tm_min,
            tm.tm_hour,
            tm.tm_mday,
            tm.tm_mon,
            tm.tm_year,
            tm.tm_isdst,
        ] {
            codec.write_int(writer, value)?;
        }

        codec.write_str(writer, Some(&self.dbname))?;
        codec.write_str(writer, Some(&self.server_version))?;
        codec.write_str(writer, Some(&self.dumper_version))?;
        Ok(())
    }

    /// Read a header, accepting every version from 1.0 up to the current
    /// one.
    ///
    /// `expected` is checked against the format byte unless it is
    /// [`ArchiveFormat::Unknown`].
    pub fn read(reader: &mut dyn Read, expected: ArchiveFormat) -> Result<Self, Error> {
        let mut magic = [0u8; 5];
        reader.read_exact(&mut magic).map_err(map_read_error)?;
        if &magic != ARCHIVE_MAGIC {
            return Err(ArchiveError::BadMagic.into());
        }

        let mut codec = Codec {
            version: K_VERS_1_0,
            ..Codec::default()
        };

        let major = codec.read_byte(reader)?;
        let minor = codec.read_byte(reader)?;
        let rev = if major > 1 || (major == 1 && minor > 0) {
            codec.read_byte(reader)?
        } else {
            0
        };
        let version = make_archive_version(major, minor, rev);
        if !(K_VERS_1_0..=K_VERS_MAX).contains(&version) {
            return Err(ArchiveError::UnsupportedVersion { major, minor }.into());
        }
        codec.version = version;

        let int_size = codec.read_byte(reader)? as usize;
        if int_size == 0 || int_size > 32 {
            bail!("sanity check on integer size ({}) failed", int_size);
        }
        if int_size > std::mem::size_of::<i32>() {
            log::warn!(
                "archive was made on a machine with larger integers, some operations might fail"
            );
        }
        codec.int_size = int_size;

        let off_size = if version >= K_VERS_1_7 {
            codec.read_byte(reader)? as usize
        } else {
            int_size
        };
        codec.off_size = off_size;

        let tag = codec.read_byte(reader)?;
        let format = ArchiveFormat::from_tag(tag)
            .ok_or_else(|| format_err!("unrecognized file format \"{}\"", tag))?;
        if expected != ArchiveFormat::Unknown && expected != format {
            bail!(
                "expected format ({}) differs from format found in file ({})",
                expected.tag(),
                tag
            );
        }

        let compression = if version >= K_VERS_1_15 {
            let code = codec.read_byte(reader)?;
            let algorithm = CompressionAlgorithm::from_code(code)
                .ok_or_else(|| format_err!("invalid compression code: {}", code))?;
            let level = codec.read_int(reader)?;
            if algorithm == CompressionAlgorithm::None {
                CompressionSpec::NONE
            } else {
                CompressionSpec::new(algorithm, level)?
            }
        } else if version >= K_VERS_1_4 {
            CompressionSpec::from_gzip_level(codec.read_int(reader)?)
        } else if version >= K_VERS_1_2 {
            CompressionSpec::from_gzip_level(codec.read_byte(reader)? as i32)
        } else {
            CompressionSpec::from_gzip_level(-1)
        };

        let mut header = ArchiveHeader {
            major,
            minor,
            rev,
            int_size,
            off_size,
            format,
            compression,
            create_date: 0,
            dbname: String::new(),
            server_version: String::new(),
            dumper_version: String::new(),
        };

        if version >= K_VERS_1_4 {
            let mut tm: libc::tm = unsafe { std::mem::zeroed() };
            tm.tm_sec = codec.read_int(reader)?;
            tm.tm_min = codec.read_int(reader)?;
            tm.tm_hour = codec.read_int(reader)?;
            tm.tm_mday = codec.read_int(reader)?;
            tm.tm_mon = codec.read_int(reader)?;
            tm.tm_year = codec.read_int(reader)?;
            tm.tm_isdst = codec.read_int(reader)?;
            header.create_date = match proxmox_time::timelocal(&mut tm) {
                Ok(epoch) => epoch,
                Err(_) => {
                    log::warn!("invalid creation date in header");
                    0
                }
            };
            header.dbname = codec.read_string(reader)?;
        }

        if version >= K_VERS_1_10 {
            header.server_version = codec.read_string(reader)?;
            header.dumper_version = codec.read_string(reader)?;
        }

        Ok(header)
    }
}

/// Writes the per format part of a TOC entry.
pub type ExtraWriter<'a> = &'a mut dyn FnMut(&Codec, &TocEntry, &mut dyn Write) -> Result<(), Error>;

/// Reads the per format part of a TOC entry.
pub type ExtraReader<'a> = &'a mut dyn FnMut(&Codec, &mut dyn Read) -> Result<FormatExtra, Error>;

fn optional(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Write all entries in list order.
pub fn write_toc(
    codec: &Codec,
    toc: &Toc,
    writer: &mut dyn Write,
    write_extra: ExtraWriter,
) -> Result<(), Error> {
    codec.write_int(writer, toc.len() as i32)?;

    for te in toc.iter() {
        codec.write_int(writer, te.dump_id)?;
        codec.write_int(writer, if te.has_data() { 1 } else { 0 })?;
        codec.write_str(writer, Some(&te.catalog_id.tableoid.to_string()))?;
        codec.write_str(writer, Some(&te.catalog_id.oid.to_string()))?;
        codec.write_str(writer, Some(&te.tag))?;
        codec.write_str(writer, Some(te.class.desc()))?;
        codec.write_int(writer, te.section.code())?;
        codec.write_str(writer, Some(&te.defn))?;
        codec.write_str(writer, Some(&te.drop_stmt))?;
        codec.write_str(writer, optional(&te.copy_stmt))?;
        codec.write_str(writer, optional(&te.namespace))?;
        codec.write_str(writer, optional(&te.tablespace))?;
        codec.write_str(writer, Some(&te.owner))?;

        for dep in te.deps.iter() {
            codec.write_str(writer, Some(&dep.to_string()))?;
        }
        codec.write_str(writer, None)?;

        write_extra(codec, te, writer)?;
    }

    Ok(())
}

fn parse_oid(text: &str) -> Result<u32, Error> {
    text.trim()
        .parse()
        .map_err(|_| format_err!("invalid OID \"{}\" in TOC", text))
}

/// Read the TOC written by [`write_toc`], or by any older version.
pub fn read_toc(codec: &Codec, reader: &mut dyn Read, read_extra: ExtraReader) -> Result<Toc, Error> {
    let version = codec.version;
    let count = codec.read_int(reader)?;
    if count < 0 {
        bail!("invalid TOC entry count {}", count);
    }

    let mut toc = Toc::new();

    for _ in 0..count {
        let dump_id = codec.read_int(reader)?;
        if dump_id <= 0 {
            bail!("entry ID {} out of range -- perhaps a corrupt TOC", dump_id);
        }
        let had_dumper = codec.read_int(reader)? != 0;

        let catalog_id = if version >= K_VERS_1_8 {
            let tableoid = parse_oid(&codec.read_string(reader)?)?;
            let oid = parse_oid(&codec.read_string(reader)?)?;
            CatalogId::new(tableoid, oid)
        } else {
            CatalogId::new(0, parse_oid(&codec.read_string(reader)?)?)
        };

        let tag = codec.read_string(reader)?;
        let class = ObjectClass::from_desc(&codec.read_string(reader)?);

        let section = if version >= K_VERS_1_11 {
            let code = codec.read_int(reader)?;
            Section::from_code(code)
                .ok_or_else(|| format_err!("invalid section code {} in TOC entry {}", code, dump_id))?
        } else {
            class.default_section()
        };

        let defn = codec.read_string(reader)?;
        let drop_stmt = codec.read_string(reader)?;
        let copy_stmt = if version >= K_VERS_1_3 {
            codec.read_string(reader)?
        } else {
            String::new()
        };
        let namespace = if version >= K_VERS_1_6 {
            codec.read_string(reader)?
        } else {
            String::new()
        };
        let tablespace = if version >= K_VERS_1_10 {
            codec.read_string(reader)?
        } else {
            String::new()
        };
        let owner = codec.read_string(reader)?;

        let mut deps = Vec::new();
        if version >= K_VERS_1_5 {
            while let Some(dep) = codec.read_str(reader)? {
                let dep: i32 = dep
                    .trim()
                    .parse()
                    .map_err(|_| format_err!("invalid dependency \"{}\" in TOC entry {}", dep, dump_id))?;
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }

        let extra = read_extra(codec, reader)?;

        log::debug!("read TOC entry {} ({}) {}", dump_id, class, tag);

        toc.push(TocEntry {
            dump_id,
            catalog_id,
            section,
            class,
            tag,
            namespace,
            tablespace,
            owner,
            defn,
            drop_stmt,
            copy_stmt,
            deps,
            dumper: None,
            had_dumper,
            extra,
            data_length: 0,
            sort: Default::default(),
            printed: false,
        })?;
    }

    Ok(toc)
}

/// Extra TOC data of the directory and tar formats: the data file name.
pub fn write_file_extra(codec: &Codec, te: &TocEntry, writer: &mut dyn Write) -> Result<(), Error> {
    codec.write_str(writer, te.data_file())
}

pub fn read_file_extra(codec: &Codec, reader: &mut dyn Read) -> Result<FormatExtra, Error> {
    let filename = codec.read_str(reader)?.filter(|name| !name.is_empty());
    Ok(FormatExtra::File { filename })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::toc::ArchiveEntryOpts;

    #[test]
    fn header_round_trip() -> Result<(), Error> {
        let mut header = ArchiveHeader::new(ArchiveFormat::Custom, "zstd:5".parse()?);
        header.dbname = "shop".to_string();
        header.server_version = "16.2".to_string();

        let mut buf = Vec::new();
        header.write(&mut buf)?;
        assert_eq!(&buf[..5], ARCHIVE_MAGIC);
        assert_eq!(&buf[5..11], &[1, 15, 0, 4, 8, ArchiveFormat::Custom.tag()]);

        let read = ArchiveHeader::read(&mut &buf[..], ArchiveFormat::Unknown)?;
        assert_eq!(read.version(), K_VERS_MAX);
        assert_eq!(read.compression, header.compression);
        assert_eq!(read.create_date, header.create_date);
        assert_eq!(read.dbname, "shop");
        assert_eq!(read.server_version, "16.2");
        assert_eq!(read.dumper_version, DUMPER_VERSION);

        assert!(ArchiveHeader::read(&mut &buf[..], ArchiveFormat::Tar).is_err());
        Ok(())
    }

    #[test]
    fn refuse_bad_headers() {
        let err = ArchiveHeader::read(&mut &b"PGDMX\x01\x0f\x00"[..], ArchiveFormat::Unknown)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::BadMagic)));

        let err = ArchiveHeader::read(&mut &b"PGDMP\x01\x10\x00\x04\x08\x01"[..], ArchiveFormat::Unknown)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::UnsupportedVersion { major: 1, minor: 16 })
        ));

        let err = ArchiveHeader::read(&mut &b"PGDMP\x01"[..], ArchiveFormat::Unknown).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::TruncatedFile)
        ));
    }

    #[test]
    fn legacy_header_1_2() -> Result<(), Error> {
        // 1.2: no offset size, compression as a single byte, no date
        let buf = b"PGDMP\x01\x02\x00\x04\x01\x09";
        let header = ArchiveHeader::read(&mut &buf[..], ArchiveFormat::Unknown)?;
        assert_eq!(header.version(), K_VERS_1_2);
        assert_eq!(header.off_size, 4);
        assert_eq!(header.compression.algorithm, CompressionAlgorithm::Gzip);
        assert_eq!(header.compression.level, 9);
        assert_eq!(header.create_date, 0);
        Ok(())
    }

    #[test]
    fn toc_round_trip() -> Result<(), Error> {
        let codec = Codec::default();
        let mut toc = Toc::new();
        let mut te = ArchiveEntryOpts::new(ObjectClass::Table, "t")
            .namespace("public")
            .owner("alice")
            .defn("CREATE TABLE t (a int);\n")
            .drop_stmt("DROP TABLE t;\n")
            .catalog_id(CatalogId::new(1259, 16384))
            .into_entry(1);
        te.extra = FormatExtra::File { filename: None };
        toc.push(te)?;
        let mut te = ArchiveEntryOpts::new(ObjectClass::TableData, "t")
            .namespace("public")
            .copy_stmt("COPY t (a) FROM stdin;\n")
            .deps(&[1])
            .into_entry(2);
        te.had_dumper = true;
        te.extra = FormatExtra::File {
            filename: Some("2.dat".to_string()),
        };
        toc.push(te)?;

        let mut buf = Vec::new();
        write_toc(&codec, &toc, &mut buf, &mut write_file_extra)?;
        let read = read_toc(&codec, &mut &buf[..], &mut read_file_extra)?;

        assert_eq!(read.ids(), vec![1, 2]);
        let (a, b) = (toc.get(2).unwrap(), read.get(2).unwrap());
        assert_eq!(a.deps, b.deps);
        assert_eq!(a.copy_stmt, b.copy_stmt);
        assert_eq!(a.extra, b.extra);
        assert!(b.had_dumper);
        let t = read.get(1).unwrap();
        assert_eq!(t.catalog_id, CatalogId::new(1259, 16384));
        assert_eq!(t.section, Section::PreData);
        assert_eq!(t.owner, "alice");
        assert_eq!(t.extra, FormatExtra::File { filename: None });
        Ok(())
    }
}
