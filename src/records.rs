//! The zone as a canonically sorted record collection.

use std::cmp::min;
use std::io;
use std::slice;

use bytes::Bytes;
use domain::base::cmp::CanonicalOrd;
use domain::base::iana::{Class, Rtype};
use domain::base::name::{FlattenInto, ToName};
use domain::base::rdata::ComposeRecordData;
use domain::base::record::Record;
use domain::base::wire::Compose;
use domain::base::{Name, Ttl};
use domain::rdata::{Soa, ZoneRecordData};
use domain::zonefile::inplace::{self, Entry};
use tracing::{debug, warn};

use crate::error::Error;

//------------ Type aliases --------------------------------------------------

pub type ZoneName = Name<Bytes>;
pub type ZoneData = ZoneRecordData<Bytes, ZoneName>;
pub type ZoneRecord = Record<ZoneName, ZoneData>;

//------------ SortedRecords -------------------------------------------------

/// A collection of resource records in DNSSEC canonical order.
///
/// Ordering is by owner name (label-reversed octet comparison), then type
/// code, then canonical RDATA. The NSEC and NSEC3 chains and the signing
/// order all hang off this ordering.
#[derive(Clone, Default)]
pub struct SortedRecords {
    records: Vec<ZoneRecord>,
}

impl SortedRecords {
    pub fn new() -> Self {
        SortedRecords {
            records: Vec::new(),
        }
    }

    /// Insert a record at its canonical position.
    ///
    /// A record that compares equal to one already present (same owner,
    /// class, type and canonical RDATA) is returned to the caller unchanged.
    pub fn insert(&mut self, record: ZoneRecord) -> Result<(), ZoneRecord> {
        let idx = self
            .records
            .binary_search_by(|stored| stored.canonical_cmp(&record));
        match idx {
            Ok(_) => Err(record),
            Err(idx) => {
                self.records.insert(idx, record);
                Ok(())
            }
        }
    }

    /// Add records in bulk, re-sorting afterwards.
    pub fn extend(&mut self, iter: impl IntoIterator<Item = ZoneRecord>) {
        self.records.extend(iter);
        self.records.sort_by(CanonicalOrd::canonical_cmp);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, ZoneRecord> {
        self.records.iter()
    }

    /// Iterate over the families (same owner and class) of the zone.
    pub fn families(&self) -> RecordsIter<'_> {
        RecordsIter::new(&self.records)
    }

    /// Iterate over the RRsets of the zone.
    pub fn rrsets(&self) -> RrsetIter<'_> {
        RrsetIter::new(&self.records)
    }

    pub fn find_soa(&self) -> Option<Rrset<'_>> {
        self.rrsets().find(|rrset| rrset.rtype() == Rtype::SOA)
    }

    /// Replace the SOA record's data, keeping its position.
    pub fn replace_soa(&mut self, new_soa: Soa<ZoneName>) {
        if let Some(record) = self
            .records
            .iter_mut()
            .find(|record| record.rtype() == Rtype::SOA)
        {
            if let ZoneRecordData::Soa(current_soa) = record.data_mut() {
                *current_soa = new_soa;
            }
        }
    }

    /// Bump the SOA serial by the given increment.
    pub fn bump_soa_serial(&mut self, increment: u32) -> Result<(), Error> {
        let Some(soa_rrset) = self.find_soa() else {
            return Err(Error::parse("zone has no SOA record"));
        };
        let ZoneRecordData::Soa(old_soa) = soa_rrset.first().data() else {
            unreachable!();
        };

        let new_soa = Soa::new(
            old_soa.mname().clone(),
            old_soa.rname().clone(),
            old_soa.serial().add(increment),
            old_soa.refresh(),
            old_soa.retry(),
            old_soa.expire(),
            old_soa.minimum(),
        );
        self.replace_soa(new_soa);

        Ok(())
    }

    /// Force every RRset onto a single TTL.
    ///
    /// Records sharing an owner, class and type must share a TTL as well.
    /// Divergent runs are rewritten to the minimum TTL of the run, once,
    /// with a warning.
    pub fn normalize_rrset_ttls(&mut self) {
        let mut start = 0;
        while start < self.records.len() {
            let mut end = start + 1;
            while self.records.get(end).is_some_and(|record| {
                record.owner() == self.records[start].owner()
                    && record.class() == self.records[start].class()
                    && record.rtype() == self.records[start].rtype()
            }) {
                end += 1;
            }

            let run = &self.records[start..end];
            let ttl = run.iter().map(|record| record.ttl()).min().unwrap();
            if run.iter().any(|record| record.ttl() != ttl) {
                warn!(
                    "normalizing divergent TTLs of the {} RRset at {} to {}",
                    run[0].rtype(),
                    run[0].owner(),
                    ttl.as_secs(),
                );
                for record in &mut self.records[start..end] {
                    record.set_ttl(ttl);
                }
            }

            start = end;
        }
    }

    /// Write the zone in presentation format, SOA first.
    pub fn write(&self, target: &mut impl core::fmt::Write) -> Result<(), core::fmt::Error> {
        for record in self.records.iter().filter(|r| r.rtype() == Rtype::SOA) {
            writeln!(target, "{record}")?;
        }
        for record in self.records.iter().filter(|r| r.rtype() != Rtype::SOA) {
            writeln!(target, "{record}")?;
        }
        Ok(())
    }
}

impl From<Vec<ZoneRecord>> for SortedRecords {
    fn from(mut src: Vec<ZoneRecord>) -> Self {
        src.sort_by(CanonicalOrd::canonical_cmp);
        SortedRecords { records: src }
    }
}

impl FromIterator<ZoneRecord> for SortedRecords {
    fn from_iter<T: IntoIterator<Item = ZoneRecord>>(iter: T) -> Self {
        let mut res = Self::new();
        for item in iter {
            let _ = res.insert(item);
        }
        res
    }
}

//------------ Zone loading --------------------------------------------------

/// Read a zone in master file format into sorted records.
///
/// Exact duplicate records are collapsed. Relative owner names are resolved
/// against `origin` if one is given.
pub fn load_zone(
    mut reader: impl io::Read,
    origin: Option<&ZoneName>,
) -> Result<SortedRecords, Error> {
    let mut zonefile = inplace::Zonefile::load(&mut reader)?;
    if let Some(origin) = origin {
        zonefile.set_origin(origin.clone());
    }

    let mut records = SortedRecords::new();
    for entry in zonefile {
        let entry = entry.map_err(|err| Error::parse(format!("invalid zone file: {err}")))?;
        match entry {
            Entry::Record(record) => {
                let record: ZoneRecord = record.flatten_into();
                if let Err(record) = records.insert(record) {
                    debug!(
                        "collapsing duplicate {} record at {}",
                        record.rtype(),
                        record.owner()
                    );
                }
            }
            Entry::Include { .. } => {
                return Err(Error::parse(
                    "invalid zone file: $INCLUDE directive is not supported",
                ));
            }
        }
    }

    records.normalize_rrset_ttls();
    Ok(records)
}

/// Locate the apex of the zone and the TTL for its denial records.
///
/// There must be exactly one SOA record and it must sit at the expected apex
/// if one is given; every other record must be at or below the apex. The
/// returned TTL is the lesser of the SOA minimum and the SOA TTL (RFC 9077).
pub fn find_apex(
    records: &SortedRecords,
    expected: Option<&ZoneName>,
) -> Result<(FamilyName, Ttl), Error> {
    let Some(soa) = records.find_soa() else {
        return Err(Error::parse("zone has no SOA record"));
    };
    if soa.iter().len() > 1 {
        return Err(Error::parse(format!(
            "zone has more than one SOA record at {}",
            soa.owner()
        )));
    }
    let ZoneRecordData::Soa(ref soa_data) = *soa.first().data() else {
        unreachable!();
    };
    let ttl = min(soa_data.minimum(), soa.ttl());
    let apex = soa.family_name();

    if let Some(expected) = expected {
        if !apex.owner().name_eq(expected) {
            return Err(Error::parse(format!(
                "zone apex ({}) does not match the expected apex ({expected})",
                apex.owner()
            )));
        }
    }

    for record in records.iter() {
        if record.rtype() == Rtype::SOA && !record.owner().name_eq(apex.owner()) {
            return Err(Error::parse(format!(
                "second SOA record at {} inside zone {}",
                record.owner(),
                apex.owner()
            )));
        }
        if !record.owner().ends_with(apex.owner()) {
            return Err(Error::parse(format!(
                "record owner {} is out of zone {}",
                record.owner(),
                apex.owner()
            )));
        }
    }

    Ok((apex, ttl))
}

//------------ FamilyName ----------------------------------------------------

/// The identifier for a family: an owner name and a class.
#[derive(Clone)]
pub struct FamilyName {
    owner: ZoneName,
    class: Class,
}

impl FamilyName {
    pub fn new(owner: ZoneName, class: Class) -> Self {
        FamilyName { owner, class }
    }

    pub fn owner(&self) -> &ZoneName {
        &self.owner
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn into_record(self, ttl: Ttl, data: ZoneData) -> ZoneRecord {
        Record::new(self.owner, self.class, ttl, data)
    }
}

//------------ Family --------------------------------------------------------

/// All records sharing an owner name and class.
#[derive(Clone)]
pub struct Family<'a> {
    slice: &'a [ZoneRecord],
}

impl<'a> Family<'a> {
    fn new(slice: &'a [ZoneRecord]) -> Self {
        Family { slice }
    }

    pub fn owner(&self) -> &'a ZoneName {
        self.slice[0].owner()
    }

    pub fn class(&self) -> Class {
        self.slice[0].class()
    }

    pub fn family_name(&self) -> FamilyName {
        FamilyName::new(self.owner().clone(), self.class())
    }

    pub fn rrsets(&self) -> FamilyIter<'a> {
        FamilyIter::new(self.slice)
    }

    pub fn records(&self) -> slice::Iter<'a, ZoneRecord> {
        self.slice.iter()
    }

    /// Whether this family is the parent side of a zone cut.
    pub fn is_zone_cut(&self, apex: &FamilyName) -> bool {
        !self.owner().name_eq(apex.owner())
            && self
                .records()
                .any(|record| record.rtype() == Rtype::NS)
    }

    pub fn is_in_zone(&self, apex: &FamilyName) -> bool {
        self.owner().ends_with(apex.owner()) && self.class() == apex.class()
    }
}

//------------ Rrset ---------------------------------------------------------

/// All records sharing an owner name, class, and record type.
pub struct Rrset<'a> {
    slice: &'a [ZoneRecord],
}

impl<'a> Rrset<'a> {
    fn new(slice: &'a [ZoneRecord]) -> Self {
        Rrset { slice }
    }

    pub fn owner(&self) -> &'a ZoneName {
        self.slice[0].owner()
    }

    pub fn class(&self) -> Class {
        self.slice[0].class()
    }

    pub fn family_name(&self) -> FamilyName {
        FamilyName::new(self.owner().clone(), self.class())
    }

    pub fn rtype(&self) -> Rtype {
        self.slice[0].rtype()
    }

    pub fn ttl(&self) -> Ttl {
        self.slice[0].ttl()
    }

    pub fn first(&self) -> &'a ZoneRecord {
        &self.slice[0]
    }

    pub fn iter(&self) -> slice::Iter<'a, ZoneRecord> {
        self.slice.iter()
    }
}

//------------ RecordsIter ---------------------------------------------------

/// An iterator that produces families from sorted records.
pub struct RecordsIter<'a> {
    slice: &'a [ZoneRecord],
}

impl<'a> RecordsIter<'a> {
    fn new(slice: &'a [ZoneRecord]) -> Self {
        RecordsIter { slice }
    }

    pub fn first_owner(&self) -> &'a ZoneName {
        self.slice[0].owner()
    }

    /// Skip anything sorting before the apex.
    pub fn skip_before(&mut self, apex: &FamilyName) {
        while let Some(first) = self.slice.first() {
            if first.class() == apex.class()
                && (first.owner().name_eq(apex.owner())
                    || first.owner().ends_with(apex.owner()))
            {
                break;
            }
            self.slice = &self.slice[1..]
        }
    }
}

impl<'a> Iterator for RecordsIter<'a> {
    type Item = Family<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.slice.first()?;
        let mut end = 1;
        while let Some(record) = self.slice.get(end) {
            if !record.owner().name_eq(first.owner()) || record.class() != first.class() {
                break;
            }
            end += 1;
        }
        let (res, slice) = self.slice.split_at(end);
        self.slice = slice;
        Some(Family::new(res))
    }
}

//------------ RrsetIter -----------------------------------------------------

/// An iterator that produces RRsets from sorted records.
pub struct RrsetIter<'a> {
    slice: &'a [ZoneRecord],
}

impl<'a> RrsetIter<'a> {
    fn new(slice: &'a [ZoneRecord]) -> Self {
        RrsetIter { slice }
    }
}

impl<'a> Iterator for RrsetIter<'a> {
    type Item = Rrset<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.slice.first()?;
        let mut end = 1;
        while let Some(record) = self.slice.get(end) {
            if !record.owner().name_eq(first.owner())
                || record.rtype() != first.rtype()
                || record.class() != first.class()
            {
                break;
            }
            end += 1;
        }
        let (res, slice) = self.slice.split_at(end);
        self.slice = slice;
        Some(Rrset::new(res))
    }
}

//------------ FamilyIter ----------------------------------------------------

/// An iterator that produces RRsets from a record family.
pub struct FamilyIter<'a> {
    slice: &'a [ZoneRecord],
}

impl<'a> FamilyIter<'a> {
    fn new(slice: &'a [ZoneRecord]) -> Self {
        FamilyIter { slice }
    }
}

impl<'a> Iterator for FamilyIter<'a> {
    type Item = Rrset<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.slice.first()?;
        let mut end = 1;
        while let Some(record) = self.slice.get(end) {
            if record.rtype() != first.rtype() {
                break;
            }
            end += 1;
        }
        let (res, slice) = self.slice.split_at(end);
        self.slice = slice;
        Some(Rrset::new(res))
    }
}

//------------ Canonical wire form -------------------------------------------

/// Append the canonical wire form of a record, substituting the given TTL.
///
/// This is the RFC 4034 section 6.2 image used for signing: the owner name
/// in lowercased uncompressed labels and the RDATA in canonical form, with
/// the RRSIG original TTL in place of the record's own.
pub fn compose_canonical_with_ttl(record: &ZoneRecord, ttl: Ttl, target: &mut Vec<u8>) {
    // All appends to a Vec are infallible.
    record.owner().compose_canonical(target).unwrap();
    record.rtype().compose(target).unwrap();
    record.class().compose(target).unwrap();
    ttl.compose(target).unwrap();
    record.data().compose_canonical_len_rdata(target).unwrap();
}
