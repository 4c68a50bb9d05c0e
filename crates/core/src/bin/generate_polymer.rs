//! Write a sample random-walk polymer trajectory in GSD format.
//!
//! Usage: generate_polymer <out.gsd> [n_monomers] [n_frames] [seed]

use std::error::Error;
use std::process;

use log::info;

use pk_core::trajectory::gsd::{
    GsdWriter, BONDS_N, BOND_GROUP, BOX, PARTICLE_COUNT, POSITION, STEP, TYPES,
};
use pk_core::util::wrap_centered;

/// Monomers per unit volume used to size the periodic box.
const DENSITY: f64 = 0.2;
const STEPS_PER_FRAME: u64 = 10_000;

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }

    /// Uniform direction on the unit sphere.
    fn unit_vector(&mut self) -> [f64; 3] {
        loop {
            let v = [self.gauss(0.0, 1.0), self.gauss(0.0, 1.0), self.gauss(0.0, 1.0)];
            let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            if norm > 1e-9 {
                return [v[0] / norm, v[1] / norm, v[2] / norm];
            }
        }
    }
}

/// Unwrapped random walk with unit bond length, starting at the origin.
fn random_walk(n: usize, rng: &mut SimpleRng) -> Vec<[f64; 3]> {
    let mut chain = Vec::with_capacity(n);
    let mut current = [0.0f64; 3];
    for _ in 0..n {
        chain.push(current);
        let step = rng.unit_vector();
        for axis in 0..3 {
            current[axis] += step[axis];
        }
    }
    chain
}

fn parse_arg<T: std::str::FromStr>(args: &[String], i: usize, default: T) -> Result<T, String> {
    match args.get(i) {
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("argument {} (`{}`) is not a valid number", i, raw)),
        None => Ok(default),
    }
}

fn run(args: &[String]) -> Result<(), Box<dyn Error>> {
    let out = args
        .get(1)
        .ok_or("usage: generate_polymer <out.gsd> [n_monomers] [n_frames] [seed]")?;
    let n_monomers: usize = parse_arg(args, 2, 1000)?;
    let n_frames: usize = parse_arg(args, 3, 10)?;
    let seed: u64 = parse_arg(args, 4, 42)?;
    if n_monomers == 0 || n_frames == 0 {
        return Err("n_monomers and n_frames must be positive".into());
    }

    let box_size = (n_monomers as f64 / DENSITY).cbrt().max(10.0);
    let mut rng = SimpleRng::new(seed);
    let mut chain = random_walk(n_monomers, &mut rng);

    let mut writer = GsdWriter::create_hoomd(out, "polykit generate_polymer")?;
    let n_bonds = n_monomers - 1;
    let bonds: Vec<u32> = (0..n_bonds as u32).flat_map(|i| [i, i + 1]).collect();

    for frame in 0..n_frames {
        if frame > 0 {
            // Gaussian jiggle keeps successive frames correlated
            for monomer in &mut chain {
                for c in monomer.iter_mut() {
                    *c += rng.gauss(0.0, 0.1);
                }
            }
        }
        let wrapped: Vec<f32> = chain
            .iter()
            .flat_map(|p| p.map(|c| wrap_centered(c, box_size) as f32))
            .collect();

        writer.write_chunk(STEP, 1, 1, &[frame as u64 * STEPS_PER_FRAME])?;
        if frame == 0 {
            let l = box_size as f32;
            writer.write_chunk(PARTICLE_COUNT, 1, 1, &[n_monomers as u32])?;
            writer.write_chunk(BOX, 1, 6, &[l, l, l, 0.0, 0.0, 0.0])?;
            writer.write_strings(TYPES, &["A"])?;
            writer.write_chunk(BONDS_N, 1, 1, &[n_bonds as u32])?;
            writer.write_strings("bonds/types", &["polymer"])?;
            writer.write_chunk(BOND_GROUP, n_bonds, 2, &bonds)?;
        }
        writer.write_chunk(POSITION, n_monomers, 3, &wrapped)?;
        writer.end_frame();
    }
    writer.finish()?;

    info!(
        "wrote {} frames of a {}-monomer chain to {} (box {:.2})",
        n_frames, n_monomers, out, box_size
    );
    Ok(())
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        eprintln!("generate_polymer: {}", e);
        process::exit(1);
    }
}
