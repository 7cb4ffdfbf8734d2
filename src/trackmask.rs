//! Track-mask compression: throw away a constant set of bits from every
//! 64-bit word of sample data.
//!
//! A 64-bit mask selects the tracks to keep. The planner derives an ordered
//! series of shift-and-OR steps that packs the retained bits of consecutive
//! input words into full output words: the accumulator starts as the masked
//! input word itself, and every step moves bits from a source word onto
//! positions the accumulator still has free. When a source word drains it is
//! refilled from the next input word; when the accumulator fills, an output
//! word is emitted. A solution is complete when both happen on the same
//! step, closing the cycle.
//!
//! The planner lowers a solution into a fixed table of word-indexed
//! operations executed by [`Compressor`]; a process-wide cache reuses the
//! lowered program while the `(mask, words, signmag)` triple is unchanged.

use lazy_static::lazy_static;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("track mask {0:#018x} keeps no bits or all bits")]
    DegenerateMask(u64),
    #[error("planner failed to close a cycle for mask {0:#018x}")]
    NoSolution(u64),
    #[error("block of {0} words is not a multiple of the {1}-word cycle")]
    BadBlockSize(u32, u32),
}

type Result<T, E = Error> = std::result::Result<T, E>;

fn apply_shift(word: u64, shift: i32) -> u64 {
    if shift >= 0 {
        word << shift as u32
    } else {
        word >> (-shift) as u32
    }
}

/// One shift-and-OR operation of a solution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    /// Bit shift; positive moves toward the MSB.
    pub shift: i32,
    /// Source positions the moved bits come from.
    pub mask_from: u64,
    /// Accumulator positions they land on.
    pub mask_to: u64,
    pub bits_moved: u32,
    /// Source word drained; the next step reads the following input word.
    pub dec_src: bool,
    /// Accumulator full; an output word is emitted.
    pub inc_dst: bool,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "move {:2} bits {} {:2} ({:#018x} -> {:#018x}){}{}",
            self.bits_moved,
            if self.shift >= 0 { "<<" } else { ">>" },
            self.shift.abs(),
            self.mask_from,
            self.mask_to,
            if self.dec_src { " src+" } else { "" },
            if self.inc_dst { " dst+" } else { "" },
        )
    }
}

/// An ordered series of steps packing a track mask's retained bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Solution {
    trackmask: u64,
    steps: Vec<Step>,
    n_dstinc: u32,
    n_srcdec: u32,
    n_bits_moved: u32,
}

impl Solution {
    pub fn trackmask(&self) -> u64 {
        self.trackmask
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Input words consumed per loop iteration.
    pub fn cycle(&self) -> u32 {
        self.n_dstinc + self.n_srcdec
    }

    /// Output words produced per loop iteration.
    pub fn compressed_cycle(&self) -> u32 {
        self.n_dstinc
    }

    /// Output words over input words, in (0, 1].
    pub fn compression_factor(&self) -> f64 {
        f64::from(self.compressed_cycle()) / f64::from(self.cycle())
    }

    /// Output words when compressing `input` words.
    pub fn output_words(&self, input: u32) -> u32 {
        let (c, k) = (self.cycle(), self.compressed_cycle());
        (input / c) * k + (input % c).min(k)
    }

    /// Input words required for `output` compressed words.
    pub fn input_words(&self, output: u32) -> u32 {
        let (c, k) = (self.cycle(), self.compressed_cycle());
        (output / k) * c + (output % k)
    }

    /// Smaller is better: step count, word advances, then bits shuffled.
    pub fn quality(&self) -> (usize, u32, u32) {
        (
            self.steps.len(),
            self.n_dstinc + self.n_srcdec,
            self.n_bits_moved,
        )
    }

    /// Human-readable rendition of the packing program, for diagnostics.
    pub fn program_listing(&self) -> String {
        let mut out = format!(
            "mask {:#018x}: {} words in, {} words out\n",
            self.trackmask,
            self.cycle(),
            self.compressed_cycle()
        );
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("  {:3}: {}\n", i, step));
        }
        out
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} steps, {} -> {} words",
            self.steps.len(),
            self.cycle(),
            self.compressed_cycle()
        )
    }
}

// Upper bound on planner iterations; any real mask closes its cycle in far
// fewer steps (the cycle length divides 64).
const MAX_STEPS: usize = 64 * 64;

/// Picks the shift moving the most source bits onto free accumulator
/// positions; ties go to the smallest |shift|, preferring packing downward.
fn best_shift(source: u64, acc: u64, prefer_negative: bool) -> (i32, u64) {
    let mut best: (i32, u64, u32) = (0, 0, 0);
    for magnitude in 0..64 {
        let candidates: [i32; 2] = if prefer_negative {
            [-magnitude, magnitude]
        } else {
            [magnitude, -magnitude]
        };
        for &s in &candidates {
            let landed = apply_shift(source, s) & !acc;
            let n = landed.count_ones();
            if n > best.2 {
                best = (s, landed, n);
            }
        }
    }
    (best.0, best.1)
}

fn solve_with(trackmask: u64, prefer_negative: bool) -> Result<Solution> {
    let mut steps = Vec::new();
    let mut acc = trackmask;
    let mut src = trackmask;
    let (mut n_dstinc, mut n_srcdec, mut n_bits) = (0u32, 0u32, 0u32);

    while steps.len() < MAX_STEPS {
        let (shift, mask_to) = best_shift(src, acc, prefer_negative);
        if mask_to == 0 {
            return Err(Error::NoSolution(trackmask));
        }
        let mask_from = apply_shift(mask_to, -shift);
        acc |= mask_to;
        src &= !mask_from;
        let bits = mask_to.count_ones();
        n_bits += bits;

        let dec_src = src == 0;
        let inc_dst = acc == !0u64;
        steps.push(Step {
            shift,
            mask_from,
            mask_to,
            bits_moved: bits,
            dec_src,
            inc_dst,
        });
        if dec_src {
            n_srcdec += 1;
        }
        if inc_dst {
            n_dstinc += 1;
        }
        if dec_src && inc_dst {
            return Ok(Solution {
                trackmask,
                steps,
                n_dstinc,
                n_srcdec,
                n_bits_moved: n_bits,
            });
        }
        if dec_src {
            src = trackmask;
        }
        if inc_dst {
            acc = trackmask;
        }
    }
    Err(Error::NoSolution(trackmask))
}

/// Plans a compression for `trackmask`, retaining the best solution found.
pub fn solve(trackmask: u64) -> Result<Solution> {
    if trackmask == 0 || trackmask == !0u64 {
        return Err(Error::DegenerateMask(trackmask));
    }
    let down = solve_with(trackmask, true);
    let up = solve_with(trackmask, false);
    match (down, up) {
        (Ok(a), Ok(b)) => Ok(if a.quality() <= b.quality() { a } else { b }),
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(e), Err(_)) => Err(e),
    }
}

// Word-indexed operation tables derived from a solution. `bases[j]` is the
// input position whose masked copy seeds output word `j`; each entry of
// `ops` OR-moves bits from input position `src` into output word `dst`.
struct Program {
    bases: Vec<usize>,
    ops: Vec<Op>,
}

struct Op {
    dst: usize,
    src: usize,
    mask_from: u64,
    shift: i32,
}

impl Program {
    fn lower(solution: &Solution) -> Program {
        let steps = solution.steps();
        let mut bases = vec![0usize];
        let mut ops = Vec::with_capacity(steps.len());
        let mut next = 1usize;
        let mut cur_src = next;
        next += 1;
        for (i, step) in steps.iter().enumerate() {
            ops.push(Op {
                dst: bases.len() - 1,
                src: cur_src,
                mask_from: step.mask_from,
                shift: step.shift,
            });
            let last = i == steps.len() - 1;
            if step.inc_dst && !last {
                bases.push(next);
                next += 1;
            }
            if step.dec_src && !last {
                cur_src = next;
                next += 1;
            }
        }
        debug_assert_eq!(next as u32, solution.cycle());
        debug_assert_eq!(bases.len() as u32, solution.compressed_cycle());
        Program { bases, ops }
    }
}

/// Executable compress/decompress pair for one solution.
pub struct Compressor {
    solution: Solution,
    program: Program,
    words_per_block: u32,
    signmag_distance: i32,
}

impl Compressor {
    /// `words_per_block` is the compressor's working unit (the read size in
    /// 64-bit words) and must hold whole cycles.
    pub fn new(solution: Solution, words_per_block: u32, signmag_distance: i32) -> Result<Self> {
        if words_per_block == 0 || words_per_block % solution.cycle() != 0 {
            return Err(Error::BadBlockSize(words_per_block, solution.cycle()));
        }
        let program = Program::lower(&solution);
        Ok(Compressor {
            solution,
            program,
            words_per_block,
            signmag_distance,
        })
    }

    pub fn solution(&self) -> &Solution {
        &self.solution
    }

    pub fn words_per_block(&self) -> u32 {
        self.words_per_block
    }

    /// Compresses one block of `words_per_block` input words.
    pub fn compress(&self, input: &[u64], output: &mut Vec<u64>) -> Result<u32> {
        if input.len() != self.words_per_block as usize {
            return Err(Error::BadBlockSize(
                input.len() as u32,
                self.solution.cycle(),
            ));
        }
        let mask = self.solution.trackmask();
        let cycle = self.solution.cycle() as usize;
        let mut produced = 0;
        for group in input.chunks_exact(cycle) {
            let mut out: Vec<u64> = self
                .program
                .bases
                .iter()
                .map(|&pos| group[pos] & mask)
                .collect();
            for op in &self.program.ops {
                out[op.dst] |= apply_shift(group[op.src] & op.mask_from, op.shift);
            }
            produced += out.len() as u32;
            output.extend_from_slice(&out);
        }
        Ok(produced)
    }

    /// Expands compressed words back to `words_per_block` words. Discarded
    /// track positions come back as zeros unless a sign/magnitude distance
    /// is configured, in which case magnitude bits are rebuilt from the
    /// retained sign bits at that distance.
    pub fn decompress(&self, input: &[u64], output: &mut Vec<u64>) -> Result<u32> {
        let mask = self.solution.trackmask();
        let cycle = self.solution.cycle() as usize;
        let k = self.solution.compressed_cycle() as usize;
        if input.len() % k != 0 {
            return Err(Error::BadBlockSize(input.len() as u32, k as u32));
        }
        let mut produced = 0;
        for group in input.chunks_exact(k) {
            let mut out = vec![0u64; cycle];
            for (j, &pos) in self.program.bases.iter().enumerate() {
                out[pos] = group[j] & mask;
            }
            for op in &self.program.ops {
                out[op.src] |= apply_shift(group[op.dst] & apply_shift(op.mask_from, op.shift), -op.shift);
            }
            if self.signmag_distance != 0 {
                for w in &mut out {
                    *w |= apply_shift(*w & mask, self.signmag_distance) & !mask;
                }
            }
            produced += out.len() as u32;
            output.extend_from_slice(&out);
        }
        Ok(produced)
    }
}

lazy_static! {
    static ref CACHE: Mutex<Option<(u64, u32, i32, Arc<Compressor>)>> = Mutex::new(None);
}

/// Returns a compressor for the triple, reusing the previously lowered
/// program when the triple is unchanged.
pub fn compressor_for(
    trackmask: u64,
    words_per_block: u32,
    signmag_distance: i32,
) -> Result<Arc<Compressor>> {
    let mut cache = CACHE.lock().unwrap();
    if let Some((m, w, d, ref c)) = *cache {
        if m == trackmask && w == words_per_block && d == signmag_distance {
            return Ok(Arc::clone(c));
        }
    }
    let solution = solve(trackmask)?;
    let compressor = Arc::new(Compressor::new(solution, words_per_block, signmag_distance)?);
    *cache = Some((
        trackmask,
        words_per_block,
        signmag_distance,
        Arc::clone(&compressor),
    ));
    Ok(compressor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_half_mask_is_one_step() {
        let s = solve(0xffff_ffff_0000_0000).unwrap();
        assert_eq!(s.steps().len(), 1);
        let step = s.steps()[0];
        assert_eq!(step.shift, -32);
        assert_eq!(step.bits_moved, 32);
        assert!(step.dec_src && step.inc_dst);
        assert_eq!(s.cycle(), 2);
        assert_eq!(s.compressed_cycle(), 1);
        assert!((s.compression_factor() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn single_bit_packs_64_to_1() {
        let s = solve(1 << 63).unwrap();
        assert_eq!(s.cycle(), 64);
        assert_eq!(s.compressed_cycle(), 1);
        // every input word contributes through exactly one move
        assert!(s.steps().iter().all(|st| st.bits_moved == 1));
    }

    #[test]
    fn degenerate_masks_are_rejected() {
        assert_eq!(solve(0), Err(Error::DegenerateMask(0)));
        assert_eq!(solve(!0), Err(Error::DegenerateMask(!0)));
    }

    #[test]
    fn cycle_length_follows_gcd() {
        for &(mask, cycle, compressed) in &[
            (0x0000_0000_ffff_ffffu64, 2u32, 1u32),
            (0x00ff_00ff_00ff_00ff, 2, 1),
            (0x0000_ffff_ffff_ffff, 4, 3),
            (0x1111_1111_1111_1111, 4, 1),
        ] {
            let s = solve(mask).unwrap();
            assert_eq!(s.cycle(), cycle, "mask {:#x}", mask);
            assert_eq!(s.compressed_cycle(), compressed, "mask {:#x}", mask);
        }
    }

    #[test]
    fn mask_pattern_compresses_to_all_ones() {
        let mask = 0xffff_ffff_0000_0000u64;
        let s = solve(mask).unwrap();
        let c = Compressor::new(s, 8, 0).unwrap();
        let input = vec![mask; 8];
        let mut out = Vec::new();
        assert_eq!(c.compress(&input, &mut out).unwrap(), 4);
        assert!(out.iter().all(|&w| w == !0u64));
    }

    #[test]
    fn roundtrip_preserves_retained_bits() {
        for &mask in &[
            0xffff_ffff_0000_0000u64,
            0x0f0f_0f0f_0f0f_0f0f,
            0x8000_0000_0000_0001,
            0x0000_ffff_ffff_ffff,
        ] {
            let s = solve(mask).unwrap();
            let cycle = s.cycle();
            let words = cycle * 3;
            let c = Compressor::new(s, words, 0).unwrap();
            // deterministic junk, different per word
            let input: Vec<u64> = (0..words as u64)
                .map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ 0x5555_aaaa_5555_aaaa)
                .collect();
            let mut packed = Vec::new();
            c.compress(&input, &mut packed).unwrap();
            let mut unpacked = Vec::new();
            c.decompress(&packed, &mut unpacked).unwrap();
            assert_eq!(unpacked.len(), input.len());
            for (a, b) in input.iter().zip(&unpacked) {
                assert_eq!(a & mask, b & mask, "mask {:#x}", mask);
                assert_eq!(b & !mask, 0);
            }
        }
    }

    #[test]
    fn signmag_reconstruction_fills_discarded_tracks() {
        // sign bits on even positions, magnitudes one to the left
        let mask = 0x5555_5555_5555_5555u64;
        let s = solve(mask).unwrap();
        let words = s.cycle();
        let c = Compressor::new(s, words, 1).unwrap();
        let input = vec![mask; words as usize];
        let mut packed = Vec::new();
        c.compress(&input, &mut packed).unwrap();
        let mut unpacked = Vec::new();
        c.decompress(&packed, &mut unpacked).unwrap();
        for w in unpacked {
            assert_eq!(w, !0u64);
        }
    }

    #[test]
    fn cache_reuses_last_program() {
        let a = compressor_for(0x00ff_00ff_00ff_00ff, 16, 0).unwrap();
        let b = compressor_for(0x00ff_00ff_00ff_00ff, 16, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = compressor_for(0xffff_0000_ffff_0000, 16, 0).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn word_accounting_is_consistent() {
        let s = solve(0x0000_ffff_ffff_ffff).unwrap(); // 48 of 64 bits
        assert_eq!(s.output_words(s.cycle() * 5), s.compressed_cycle() * 5);
        assert_eq!(
            s.input_words(s.compressed_cycle() * 5),
            s.cycle() * 5
        );
    }
}
