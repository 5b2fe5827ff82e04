//! Flat ISO 9660 writer with Rock Ridge names, sized for cloud-init seeds.
//!
//! NoCloud wants a volume labelled `CIDATA` holding `meta-data`, `user-data`
//! and `network-config`. Those names are not valid ISO 9660 level 1
//! identifiers, so every file also carries a Rock Ridge `NM` entry with its
//! real name; Linux mounts the image with the long names.
//!
//! Layout (2048-byte sectors):
//!
//! | sector | content                                   |
//! |--------|-------------------------------------------|
//! | 0-15   | system area (zeros)                       |
//! | 16     | primary volume descriptor                 |
//! | 17     | volume descriptor set terminator          |
//! | 18, 19 | L and M path tables                       |
//! | 20     | root directory                            |
//! | 21     | SUSP continuation area (`ER` entry)       |
//! | 22..   | file data, each file sector-aligned       |
//!
//! Only a root directory is supported and it must fit in one sector.

use crate::error::MulchError;

const SECTOR: usize = 2048;
const PVD_SECTOR: usize = 16;
const TERMINATOR_SECTOR: usize = 17;
const L_PATH_SECTOR: usize = 18;
const M_PATH_SECTOR: usize = 19;
const ROOT_SECTOR: usize = 20;
const CONTINUATION_SECTOR: usize = 21;
const DATA_SECTOR: usize = 22;

const RRIP_ID: &[u8] = b"RRIP_1991A";
const RRIP_DESCRIPTOR: &[u8] =
    b"THE ROCK RIDGE INTERCHANGE PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS";
const RRIP_SOURCE: &[u8] = b"PLEASE CONTACT DISC PUBLISHER FOR SPECIFICATION SOURCE.  SEE PUBLISHER IDENTIFIER IN PRIMARY VOLUME DESCRIPTOR FOR CONTACT INFORMATION.";

fn iso_error(message: impl Into<String>) -> MulchError {
    MulchError::ExternalCommand {
        command: "iso9660".into(),
        message: message.into(),
    }
}

/// Files queued for one image, in directory order.
#[derive(Debug, Default)]
pub struct SeedImage {
    label: String,
    files: Vec<(String, Vec<u8>)>,
}

impl SeedImage {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            files: Vec::new(),
        }
    }

    pub fn file(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.to_string(), data.into()));
        self
    }

    pub fn build(&self) -> Result<Vec<u8>, MulchError> {
        if self.label.is_empty() || self.label.len() > 32 || !self.label.is_ascii() {
            return Err(iso_error(format!(
                "volume label '{}' must be 1 to 32 ASCII characters",
                self.label
            )));
        }

        let records = self.root_records()?;
        let total_sectors = records.last().map_or(DATA_SECTOR, |r| r.end_sector());

        let mut image = vec![0u8; total_sectors * SECTOR];
        self.write_descriptors(&mut image, total_sectors as u32);
        write_path_table(sector_mut(&mut image, L_PATH_SECTOR), u32::to_le_bytes, u16::to_le_bytes);
        write_path_table(sector_mut(&mut image, M_PATH_SECTOR), u32::to_be_bytes, u16::to_be_bytes);

        let er = er_entry();
        let mut dir = Vec::with_capacity(SECTOR);
        let mut dot_su = sp_entry();
        dot_su.extend(ce_entry(CONTINUATION_SECTOR as u32, er.len() as u32));
        dir.extend(directory_record(ROOT_SECTOR as u32, SECTOR as u32, &[0], true, &dot_su));
        dir.extend(directory_record(ROOT_SECTOR as u32, SECTOR as u32, &[1], true, &[]));
        for r in &records {
            let mut su = nm_entry(&r.name);
            su.extend(px_entry(0o100644));
            dir.extend(directory_record(
                r.sector as u32,
                r.data.len() as u32,
                level1_name(&r.name).as_bytes(),
                false,
                &su,
            ));
        }
        if dir.len() > SECTOR {
            return Err(iso_error("too many files for a single root directory sector"));
        }
        sector_mut(&mut image, ROOT_SECTOR)[..dir.len()].copy_from_slice(&dir);
        sector_mut(&mut image, CONTINUATION_SECTOR)[..er.len()].copy_from_slice(&er);

        for r in &records {
            let start = r.sector * SECTOR;
            image[start..start + r.data.len()].copy_from_slice(r.data);
        }
        Ok(image)
    }

    fn root_records(&self) -> Result<Vec<Placed<'_>>, MulchError> {
        let mut next = DATA_SECTOR;
        let mut placed = Vec::with_capacity(self.files.len());
        for (name, data) in &self.files {
            if name.is_empty() || name.len() > 200 || name.contains('/') {
                return Err(iso_error(format!("unsupported file name '{name}'")));
            }
            if u32::try_from(data.len()).is_err() {
                return Err(iso_error(format!("file '{name}' is too large")));
            }
            let entry = Placed {
                name,
                data,
                sector: next,
            };
            next = entry.end_sector();
            placed.push(entry);
        }
        Ok(placed)
    }

    fn write_descriptors(&self, image: &mut [u8], total_sectors: u32) {
        let pvd = sector_mut(image, PVD_SECTOR);
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        pvd[6] = 1;
        // system and volume identifiers are space padded
        pvd[8..72].fill(b' ');
        pvd[40..40 + self.label.len()].copy_from_slice(self.label.as_bytes());
        both_u32(&mut pvd[80..88], total_sectors);
        both_u16(&mut pvd[120..124], 1); // volume set size
        both_u16(&mut pvd[124..128], 1); // volume sequence number
        both_u16(&mut pvd[128..132], SECTOR as u16);
        both_u32(&mut pvd[132..140], 10); // one root path table entry
        pvd[140..144].copy_from_slice(&(L_PATH_SECTOR as u32).to_le_bytes());
        pvd[148..152].copy_from_slice(&(M_PATH_SECTOR as u32).to_be_bytes());
        let root = directory_record(ROOT_SECTOR as u32, SECTOR as u32, &[0], true, &[]);
        pvd[156..156 + root.len()].copy_from_slice(&root);
        // volume set, publisher, preparer and application identifiers
        pvd[190..814].fill(b' ');
        pvd[881] = 1;

        let terminator = sector_mut(image, TERMINATOR_SECTOR);
        terminator[0] = 255;
        terminator[1..6].copy_from_slice(b"CD001");
        terminator[6] = 1;
    }
}

struct Placed<'a> {
    name: &'a str,
    data: &'a [u8],
    sector: usize,
}

impl Placed<'_> {
    fn end_sector(&self) -> usize {
        self.sector + self.data.len().div_ceil(SECTOR).max(1)
    }
}

fn sector_mut(image: &mut [u8], index: usize) -> &mut [u8] {
    &mut image[index * SECTOR..(index + 1) * SECTOR]
}

/// Both-endian u32 as ISO 9660 stores most numbers: LE then BE.
fn both_u32(buf: &mut [u8], v: u32) {
    buf[..4].copy_from_slice(&v.to_le_bytes());
    buf[4..8].copy_from_slice(&v.to_be_bytes());
}

fn both_u16(buf: &mut [u8], v: u16) {
    buf[..2].copy_from_slice(&v.to_le_bytes());
    buf[2..4].copy_from_slice(&v.to_be_bytes());
}

fn write_path_table(
    buf: &mut [u8],
    extent: fn(u32) -> [u8; 4],
    parent: fn(u16) -> [u8; 2],
) {
    buf[0] = 1; // identifier length
    buf[2..6].copy_from_slice(&extent(ROOT_SECTOR as u32));
    buf[6..8].copy_from_slice(&parent(1));
}

fn directory_record(extent: u32, size: u32, id: &[u8], is_dir: bool, su: &[u8]) -> Vec<u8> {
    // identifier is padded to an even offset before the system use area
    let pad = usize::from(id.len() % 2 == 0);
    let len = 33 + id.len() + pad + su.len();
    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    both_u32(&mut rec[2..10], extent);
    both_u32(&mut rec[10..18], size);
    rec[25] = if is_dir { 0x02 } else { 0x00 };
    both_u16(&mut rec[28..32], 1);
    rec[32] = id.len() as u8;
    rec[33..33 + id.len()].copy_from_slice(id);
    rec[33 + id.len() + pad..].copy_from_slice(su);
    rec
}

/// Level 1 identifier: upper-case 8.3 with `;1` version suffix.
fn level1_name(name: &str) -> String {
    let clean = |s: &str, max: usize| -> String {
        s.chars()
            .map(|c| {
                let c = c.to_ascii_uppercase();
                if c.is_ascii_alphanumeric() { c } else { '_' }
            })
            .take(max)
            .collect()
    };
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}.{};1", clean(stem, 8), clean(ext, 3)),
        _ => format!("{}.;1", clean(name, 8)),
    }
}

fn susp_header(sig: &[u8; 2], len: usize) -> Vec<u8> {
    let mut entry = vec![0u8; len];
    entry[..2].copy_from_slice(sig);
    entry[2] = len as u8;
    entry[3] = 1;
    entry
}

fn sp_entry() -> Vec<u8> {
    let mut e = susp_header(b"SP", 7);
    e[4] = 0xBE;
    e[5] = 0xEF;
    e
}

fn ce_entry(sector: u32, length: u32) -> Vec<u8> {
    let mut e = susp_header(b"CE", 28);
    both_u32(&mut e[4..12], sector);
    both_u32(&mut e[12..20], 0);
    both_u32(&mut e[20..28], length);
    e
}

fn er_entry() -> Vec<u8> {
    let mut e = susp_header(b"ER", 8 + RRIP_ID.len() + RRIP_DESCRIPTOR.len() + RRIP_SOURCE.len());
    e[4] = RRIP_ID.len() as u8;
    e[5] = RRIP_DESCRIPTOR.len() as u8;
    e[6] = RRIP_SOURCE.len() as u8;
    e[7] = 1;
    let body = [RRIP_ID, RRIP_DESCRIPTOR, RRIP_SOURCE].concat();
    e[8..].copy_from_slice(&body);
    e
}

fn nm_entry(name: &str) -> Vec<u8> {
    let mut e = susp_header(b"NM", 5 + name.len());
    e[5..].copy_from_slice(name.as_bytes());
    e
}

fn px_entry(mode: u32) -> Vec<u8> {
    let mut e = susp_header(b"PX", 44);
    both_u32(&mut e[4..12], mode);
    both_u32(&mut e[12..20], 1); // links
    e
}
