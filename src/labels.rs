//! Gene-structure label alphabets and conversions between them.
//!
//! Two label spaces are supported: the compact 13-state space (intergenic
//! plus per-strand exon and intron phases) and the expanded 29-state space,
//! which adds per-strand start/stop codon states and splits each intron into
//! explicit start/middle/end parts.
//!
//! Lookup tables are constructed explicitly and passed by reference; nothing
//! here keeps process-wide state. Conversion is run-length based and, for
//! any sequence satisfying the 13-state adjacency rules, converting to the
//! 29-state space and back reproduces the input exactly.

use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::errors::{Result, SemiCrfError};

/// A caller-owned label name <-> id table.
#[derive(Clone, Debug)]
pub struct LabelTable {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelTable {
    /// Builds a table from names in id order.
    ///
    /// # Errors
    ///
    /// Names must be unique.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut index = HashMap::new();
        for (id, name) in names.iter().enumerate() {
            if index.insert(name.clone(), id).is_some() {
                return Err(SemiCrfError::config(format!("duplicate label name {name}")));
            }
        }
        Ok(Self { names, index })
    }

    /// The canonical 13-state table.
    #[must_use]
    pub fn interval13() -> Self {
        Self::new(canonical13().iter().map(|&(name, _)| name)).unwrap()
    }

    /// The canonical 29-state table.
    #[must_use]
    pub fn interval29() -> Self {
        Self::new(canonical29().iter().map(|&(name, _)| name)).unwrap()
    }

    /// Id of a label name.
    #[inline(always)]
    #[must_use]
    pub fn index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Name of a label id.
    #[inline(always)]
    #[must_use]
    pub fn name(&self, id: usize) -> &str {
        &self.names[id]
    }

    /// Number of labels.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if the table is empty.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Strand {
    Fwd,
    Rev,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum L13 {
    Intergenic,
    Exon(u8, Strand),
    Intron(u8, Strand),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum L29 {
    Intergenic,
    Start(Strand),
    Exon(u8, Strand),
    Stop(Strand),
    IntronStart(u8, Strand),
    IntronMid(u8, Strand),
    IntronEnd(u8, Strand),
}

fn canonical13() -> [(&'static str, L13); 13] {
    use L13::{Exon, Intergenic, Intron};
    use Strand::{Fwd, Rev};
    [
        ("intergenic", Intergenic),
        ("exon0+", Exon(0, Fwd)),
        ("exon1+", Exon(1, Fwd)),
        ("exon2+", Exon(2, Fwd)),
        ("intron0+", Intron(0, Fwd)),
        ("intron1+", Intron(1, Fwd)),
        ("intron2+", Intron(2, Fwd)),
        ("exon0-", Exon(0, Rev)),
        ("exon1-", Exon(1, Rev)),
        ("exon2-", Exon(2, Rev)),
        ("intron0-", Intron(0, Rev)),
        ("intron1-", Intron(1, Rev)),
        ("intron2-", Intron(2, Rev)),
    ]
}

fn canonical29() -> [(&'static str, L29); 29] {
    use Strand::{Fwd, Rev};
    use L29::{Exon, Intergenic, IntronEnd, IntronMid, IntronStart, Start, Stop};
    [
        ("intergenic", Intergenic),
        ("start+", Start(Fwd)),
        ("exon0+", Exon(0, Fwd)),
        ("exon1+", Exon(1, Fwd)),
        ("exon2+", Exon(2, Fwd)),
        ("stop+", Stop(Fwd)),
        ("intron0.start+", IntronStart(0, Fwd)),
        ("intron0.mid+", IntronMid(0, Fwd)),
        ("intron0.end+", IntronEnd(0, Fwd)),
        ("intron1.start+", IntronStart(1, Fwd)),
        ("intron1.mid+", IntronMid(1, Fwd)),
        ("intron1.end+", IntronEnd(1, Fwd)),
        ("intron2.start+", IntronStart(2, Fwd)),
        ("intron2.mid+", IntronMid(2, Fwd)),
        ("intron2.end+", IntronEnd(2, Fwd)),
        ("start-", Start(Rev)),
        ("exon0-", Exon(0, Rev)),
        ("exon1-", Exon(1, Rev)),
        ("exon2-", Exon(2, Rev)),
        ("stop-", Stop(Rev)),
        ("intron0.start-", IntronStart(0, Rev)),
        ("intron0.mid-", IntronMid(0, Rev)),
        ("intron0.end-", IntronEnd(0, Rev)),
        ("intron1.start-", IntronStart(1, Rev)),
        ("intron1.mid-", IntronMid(1, Rev)),
        ("intron1.end-", IntronEnd(1, Rev)),
        ("intron2.start-", IntronStart(2, Rev)),
        ("intron2.mid-", IntronMid(2, Rev)),
        ("intron2.end-", IntronEnd(2, Rev)),
    ]
}

fn semantics13(table: &LabelTable) -> Result<Vec<L13>> {
    if table.len() != 13 {
        return Err(SemiCrfError::config(format!(
            "interval13 table must have 13 labels, got {}",
            table.len()
        )));
    }
    let mut sems = vec![L13::Intergenic; 13];
    for (name, sem) in canonical13() {
        let id = table
            .index(name)
            .ok_or_else(|| SemiCrfError::config(format!("missing interval13 label {name}")))?;
        sems[id] = sem;
    }
    Ok(sems)
}

fn semantics29(table: &LabelTable) -> Result<Vec<L29>> {
    if table.len() != 29 {
        return Err(SemiCrfError::config(format!(
            "interval29 table must have 29 labels, got {}",
            table.len()
        )));
    }
    let mut sems = vec![L29::Intergenic; 29];
    for (name, sem) in canonical29() {
        let id = table
            .index(name)
            .ok_or_else(|| SemiCrfError::config(format!("missing interval29 label {name}")))?;
        sems[id] = sem;
    }
    Ok(sems)
}

fn strand13(sem: L13) -> Option<Strand> {
    match sem {
        L13::Intergenic => None,
        L13::Exon(_, s) | L13::Intron(_, s) => Some(s),
    }
}

fn strand29(sem: L29) -> Option<Strand> {
    match sem {
        L29::Intergenic => None,
        L29::Start(s) | L29::Stop(s) | L29::Exon(_, s) => Some(s),
        L29::IntronStart(_, s) | L29::IntronMid(_, s) | L29::IntronEnd(_, s) => Some(s),
    }
}

/// Maximal runs of same-strand genic positions, as `(start, end)` half-open
/// ranges.
fn genic_regions<T: Copy>(sems: &[T], strand_of: impl Fn(T) -> Option<Strand>) -> Vec<(usize, usize, Strand)> {
    let mut regions = Vec::new();
    let mut begin = None;
    for (i, &sem) in sems.iter().enumerate() {
        match (strand_of(sem), begin) {
            (Some(st), None) => begin = Some((i, st)),
            (Some(st), Some((b, cur))) if st != cur => {
                regions.push((b, i, cur));
                begin = Some((i, st));
            }
            (None, Some((b, cur))) => {
                regions.push((b, i, cur));
                begin = None;
            }
            _ => {}
        }
    }
    if let Some((b, cur)) = begin {
        regions.push((b, sems.len(), cur));
    }
    regions
}

/// Checks the 13-state adjacency rules: genes start and end on complete
/// codons (at least two of them), exon phases cycle in transcription order,
/// and each intron carries the phase it interrupts.
pub fn check_interval13_adjacency(table: &LabelTable, labels: &[usize]) -> Result<()> {
    let sems = semantics13(table)?;
    let seq: Vec<L13> = labels
        .iter()
        .map(|&l| {
            sems.get(l).copied().ok_or_else(|| {
                SemiCrfError::config(format!("label id {l} out of range for interval13"))
            })
        })
        .collect::<Result<_>>()?;
    for (begin, end, strand) in genic_regions(&seq, strand13) {
        let idxs: Vec<usize> = if strand == Strand::Fwd {
            (begin..end).collect()
        } else {
            (begin..end).rev().collect()
        };
        let mut k = 0usize;
        for (step, &i) in idxs.iter().enumerate() {
            match seq[i] {
                L13::Exon(p, _) => {
                    if usize::from(p) != k % 3 {
                        return Err(SemiCrfError::config(format!(
                            "position {i}: exon phase {p} does not continue the reading frame"
                        )));
                    }
                    k += 1;
                }
                L13::Intron(p, _) => {
                    if step == 0 || step == idxs.len() - 1 {
                        return Err(SemiCrfError::config(format!(
                            "position {i}: gene begins or ends in an intron"
                        )));
                    }
                    if usize::from(p) != k % 3 {
                        return Err(SemiCrfError::config(format!(
                            "position {i}: intron phase {p} does not match the interrupted frame"
                        )));
                    }
                }
                L13::Intergenic => unreachable!(),
            }
        }
        if k < 6 || k % 3 != 0 {
            return Err(SemiCrfError::config(format!(
                "gene at {begin}..{end} has {k} coding positions; need at least 6, a multiple of 3"
            )));
        }
    }
    Ok(())
}

/// Converts a 13-state label sequence to the 29-state space.
///
/// The first and last three coding positions of each gene become the
/// start/stop codon states; each intron run is split into start, middle, and
/// end parts.
///
/// # Errors
///
/// The input must satisfy [`check_interval13_adjacency`].
pub fn convert_interval13_to_interval29(
    t13: &LabelTable,
    t29: &LabelTable,
    labels: &[usize],
) -> Result<Vec<usize>> {
    check_interval13_adjacency(t13, labels)?;
    let sems = semantics13(t13)?;
    let out_ids = ids_by_semantic29(t29)?;
    let seq: Vec<L13> = labels.iter().map(|&l| sems[l]).collect();

    let mut out = vec![L29::Intergenic; seq.len()];
    for (begin, end, strand) in genic_regions(&seq, strand13) {
        let idxs: Vec<usize> = if strand == Strand::Fwd {
            (begin..end).collect()
        } else {
            (begin..end).rev().collect()
        };
        let exon_idxs: Vec<usize> = idxs
            .iter()
            .copied()
            .filter(|&i| matches!(seq[i], L13::Exon(..)))
            .collect();
        let n_exon = exon_idxs.len();
        for (k, &i) in exon_idxs.iter().enumerate() {
            out[i] = if k < 3 {
                L29::Start(strand)
            } else if k >= n_exon - 3 {
                L29::Stop(strand)
            } else {
                match seq[i] {
                    L13::Exon(p, _) => L29::Exon(p, strand),
                    _ => unreachable!(),
                }
            };
        }
        // intron runs, in transcription order
        let mut step = 0;
        while step < idxs.len() {
            let L13::Intron(p, _) = seq[idxs[step]] else {
                step += 1;
                continue;
            };
            let run_start = step;
            while step < idxs.len() && seq[idxs[step]] == seq[idxs[run_start]] {
                step += 1;
            }
            for (off, &i) in idxs[run_start..step].iter().enumerate() {
                out[i] = if off == 0 {
                    L29::IntronStart(p, strand)
                } else if off == step - run_start - 1 {
                    L29::IntronEnd(p, strand)
                } else {
                    L29::IntronMid(p, strand)
                };
            }
        }
    }
    Ok(out.into_iter().map(|sem| out_ids(sem)).collect())
}

/// Converts a 29-state label sequence back to the 13-state space.
///
/// Start/stop codon positions recover their exon phases from the reading
/// frame; intron parts collapse to the phase-tagged intron states.
pub fn convert_interval29_to_interval13(
    t29: &LabelTable,
    t13: &LabelTable,
    labels: &[usize],
) -> Result<Vec<usize>> {
    let sems = semantics29(t29)?;
    let out_ids = ids_by_semantic13(t13)?;
    let seq: Vec<L29> = labels
        .iter()
        .map(|&l| {
            sems.get(l).copied().ok_or_else(|| {
                SemiCrfError::config(format!("label id {l} out of range for interval29"))
            })
        })
        .collect::<Result<_>>()?;

    let mut out = vec![L13::Intergenic; seq.len()];
    for (begin, end, strand) in genic_regions(&seq, strand29) {
        let idxs: Vec<usize> = if strand == Strand::Fwd {
            (begin..end).collect()
        } else {
            (begin..end).rev().collect()
        };
        let mut k = 0usize;
        for &i in &idxs {
            out[i] = match seq[i] {
                L29::Start(_) | L29::Exon(_, _) | L29::Stop(_) => {
                    let p = (k % 3) as u8;
                    k += 1;
                    L13::Exon(p, strand)
                }
                L29::IntronStart(p, _) | L29::IntronMid(p, _) | L29::IntronEnd(p, _) => {
                    L13::Intron(p, strand)
                }
                L29::Intergenic => unreachable!(),
            };
        }
    }
    Ok(out.into_iter().map(|sem| out_ids(sem)).collect())
}

fn ids_by_semantic13(table: &LabelTable) -> Result<impl Fn(L13) -> usize> {
    semantics13(table)?;
    let mut map: HashMap<&'static str, usize> = HashMap::new();
    for (name, _) in canonical13() {
        map.insert(name, table.index(name).unwrap());
    }
    Ok(move |sem: L13| {
        let name = canonical13()
            .iter()
            .find(|&&(_, s)| s == sem)
            .map(|&(n, _)| n)
            .unwrap();
        map[name]
    })
}

fn ids_by_semantic29(table: &LabelTable) -> Result<impl Fn(L29) -> usize> {
    semantics29(table)?;
    let mut map: HashMap<&'static str, usize> = HashMap::new();
    for (name, _) in canonical29() {
        map.insert(name, table.index(name).unwrap());
    }
    Ok(move |sem: L29| {
        let name = canonical29()
            .iter()
            .find(|&&(_, s)| s == sem)
            .map(|&(n, _)| n)
            .unwrap();
        map[name]
    })
}
