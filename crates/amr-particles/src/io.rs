//! Particle files: initial-condition readers, the ASCII dump and checkpoints.
//!
//! Every particle record is `x y z mass vx vy vz [extra...]`, where the number
//! of reals after the position comes from [`SpeciesKind::n_file_reals`].
//!
//! Binary files start with a [`BinaryHeader`] followed by `count` records of
//! `dim + n_extra` little-endian `f32`. Checkpoints store one file per level,
//! `<dir>/<tag>/Level_<l>.bin`, each a [`CheckpointHeader`] followed by
//! [`ParticleRecord`]s in double precision.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use glam::{DVec3, IVec3};
use log::{debug, info};

use crate::amr::Geometry;
use crate::container::SpeciesContainer;
use crate::error::{ParticleError, Result};
use crate::particle::Particle;
use crate::species::SpeciesKind;

const CHECKPOINT_MAGIC: u32 = 0x5043_4b31;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct BinaryHeader {
    pub count: i64,
    pub dim: i32,
    pub n_extra: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CheckpointHeader {
    pub magic: u32,
    pub level: u32,
    pub count: u64,
}

/// One particle as stored in a checkpoint.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ParticleRecord {
    pub pos: [f64; 3],
    pub vel: [f64; 3],
    pub aux: [f64; 3],
    pub mass: f64,
    pub id: u64,
}

impl From<&Particle> for ParticleRecord {
    fn from(p: &Particle) -> Self {
        Self {
            pos: p.pos.to_array(),
            vel: p.vel.to_array(),
            aux: p.aux.to_array(),
            mass: p.mass,
            id: p.id,
        }
    }
}

impl From<&ParticleRecord> for Particle {
    fn from(r: &ParticleRecord) -> Self {
        Self {
            id: r.id,
            pos: DVec3::from_array(r.pos),
            vel: DVec3::from_array(r.vel),
            mass: r.mass,
            aux: DVec3::from_array(r.aux),
        }
    }
}

/// Build a particle from `x y z` plus the species' auxiliary reals.
fn from_reals(pos: DVec3, aux: &[f64]) -> Particle {
    let mut p = Particle::new(0, pos, DVec3::new(aux[1], aux[2], aux[3]), aux[0]);
    if aux.len() >= 7 {
        p.aux = DVec3::new(aux[4], aux[5], aux[6]);
    }
    p
}

fn to_reals(kind: SpeciesKind, p: &Particle) -> Vec<f64> {
    let mut r = vec![p.pos.x, p.pos.y, p.pos.z, p.mass, p.vel.x, p.vel.y, p.vel.z];
    if kind.n_file_reals() >= 7 {
        r.extend_from_slice(&p.aux.to_array());
    }
    r
}

/// Tile the domain `replicate` times per axis. The input is assumed to fill
/// the first `L / replicate` of each axis.
pub fn replicate(particles: Vec<Particle>, geom: &Geometry, replicate: IVec3) -> Vec<Particle> {
    if replicate == IVec3::ONE {
        return particles;
    }
    let step = geom.prob_length() / replicate.as_dvec3();
    let mut out = Vec::with_capacity(particles.len() * replicate.element_product() as usize);
    for k in 0..replicate.z {
        for j in 0..replicate.y {
            for i in 0..replicate.x {
                let shift = IVec3::new(i, j, k).as_dvec3() * step;
                out.extend(particles.iter().map(|p| Particle {
                    pos: p.pos + shift,
                    ..*p
                }));
            }
        }
    }
    out
}

pub fn read_ascii(path: &Path, kind: SpeciesKind) -> Result<Vec<Particle>> {
    let text = fs::read_to_string(path)?;
    let mut tokens = text
        .lines()
        .enumerate()
        .flat_map(|(i, l)| l.split_whitespace().map(move |t| (i + 1, t)));

    let (line, first) = tokens
        .next()
        .ok_or_else(|| ParticleError::parse(path, 0, "empty file"))?;
    let count: usize = first
        .parse()
        .map_err(|_| ParticleError::parse(path, line, format!("bad particle count {first:?}")))?;

    let n_reals = 3 + kind.n_file_reals();
    let mut reals = vec![0.0; n_reals];
    // Every real takes at least two bytes, so the file bounds the count.
    let mut particles = Vec::with_capacity(count.min(text.len() / (2 * n_reals)));
    for n in 0..count {
        for r in reals.iter_mut() {
            let (line, tok) = tokens.next().ok_or_else(|| {
                ParticleError::parse(path, line, format!("file ends after {n} of {count} particles"))
            })?;
            *r = tok
                .parse()
                .map_err(|_| ParticleError::parse(path, line, format!("bad real {tok:?}")))?;
        }
        particles.push(from_reals(DVec3::new(reals[0], reals[1], reals[2]), &reals[3..]));
    }
    debug!("read {count} {kind} particles from {}", path.display());
    Ok(particles)
}

pub fn write_ascii(path: &Path, container: &SpeciesContainer) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    writeln!(out, "{}", container.num_particles())?;
    for p in container.particles() {
        let line: Vec<String> = to_reals(container.kind(), p).iter().map(f64::to_string).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    out.flush()?;
    info!(
        "wrote {} {} particles to {}",
        container.num_particles(),
        container.kind(),
        path.display()
    );
    Ok(())
}

pub fn read_binary(path: &Path, kind: SpeciesKind) -> Result<Vec<Particle>> {
    let bytes = fs::read(path)?;
    let header_len = std::mem::size_of::<BinaryHeader>();
    if bytes.len() < header_len {
        return Err(ParticleError::parse(path, 0, "file shorter than its header"));
    }
    let header: BinaryHeader = bytemuck::pod_read_unaligned(&bytes[..header_len]);
    let n_extra = kind.n_file_reals();
    if header.dim != 3 || header.n_extra as usize != n_extra || header.count < 0 {
        return Err(ParticleError::parse(
            path,
            0,
            format!(
                "header says count {} dim {} n_extra {}, expected dim 3 and n_extra {n_extra}",
                header.count, header.dim, header.n_extra
            ),
        ));
    }
    let stride = 3 + n_extra;
    let count = header.count as usize;
    let payload = &bytes[header_len..];
    let expected = count
        .checked_mul(stride * std::mem::size_of::<f32>())
        .ok_or_else(|| ParticleError::parse(path, 0, format!("particle count {count} overflows")))?;
    if payload.len() != expected {
        return Err(ParticleError::parse(
            path,
            header_len,
            format!("payload has {} bytes, header implies {expected}", payload.len()),
        ));
    }
    let reals: Vec<f32> = bytemuck::pod_collect_to_vec(payload);
    let particles = reals
        .chunks_exact(stride)
        .map(|r| {
            let r: Vec<f64> = r.iter().map(|&v| f64::from(v)).collect();
            from_reals(DVec3::new(r[0], r[1], r[2]), &r[3..])
        })
        .collect();
    debug!("read {count} {kind} particles from {}", path.display());
    Ok(particles)
}

/// Write particles in the binary initial-condition format (single precision).
pub fn write_binary(path: &Path, kind: SpeciesKind, particles: &[Particle]) -> Result<()> {
    let header = BinaryHeader {
        count: particles.len() as i64,
        dim: 3,
        n_extra: kind.n_file_reals() as i32,
    };
    let reals: Vec<f32> = particles
        .iter()
        .flat_map(|p| to_reals(kind, p))
        .map(|v| v as f32)
        .collect();
    let mut out = BufWriter::new(fs::File::create(path)?);
    out.write_all(bytemuck::bytes_of(&header))?;
    out.write_all(bytemuck::cast_slice(&reals))?;
    out.flush()?;
    Ok(())
}

/// Paths listed in a meta file, resolved against the meta file's directory.
pub fn read_meta(path: &Path) -> Result<Vec<PathBuf>> {
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let text = fs::read_to_string(path)?;
    let files: Vec<PathBuf> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| base.join(l))
        .collect();
    if files.is_empty() {
        return Err(ParticleError::parse(path, 0, "meta file lists no particle files"));
    }
    Ok(files)
}

pub fn read_binary_meta(path: &Path, kind: SpeciesKind) -> Result<Vec<Particle>> {
    let mut particles = Vec::new();
    for file in read_meta(path)? {
        particles.extend(read_binary(&file, kind)?);
    }
    Ok(particles)
}

fn level_file(dir: &Path, kind: SpeciesKind, level: usize) -> PathBuf {
    dir.join(kind.checkpoint_tag()).join(format!("Level_{level}.bin"))
}

/// Write every level of `container` under `dir/<tag>/`.
pub fn write_checkpoint(dir: &Path, container: &SpeciesContainer) -> Result<()> {
    let kind = container.kind();
    let species_dir = dir.join(kind.checkpoint_tag());
    if species_dir.exists() {
        fs::remove_dir_all(&species_dir)?;
    }
    fs::create_dir_all(&species_dir)?;
    for level in 0..container.num_levels() {
        let records: Vec<ParticleRecord> = container
            .particles_at_level(level)
            .map(ParticleRecord::from)
            .collect();
        let header = CheckpointHeader {
            magic: CHECKPOINT_MAGIC,
            level: level as u32,
            count: records.len() as u64,
        };
        let mut out = BufWriter::new(fs::File::create(level_file(dir, kind, level))?);
        out.write_all(bytemuck::bytes_of(&header))?;
        out.write_all(bytemuck::cast_slice(&records))?;
        out.flush()?;
    }
    info!(
        "checkpointed {} {kind} particles to {}",
        container.num_particles(),
        species_dir.display()
    );
    Ok(())
}

/// Particles per level as written by [`write_checkpoint`].
pub fn read_checkpoint(dir: &Path, kind: SpeciesKind) -> Result<Vec<Vec<Particle>>> {
    let species_dir = dir.join(kind.checkpoint_tag());
    if !species_dir.is_dir() {
        return Err(ParticleError::config(format!(
            "checkpoint has no {} directory for {kind} particles",
            species_dir.display()
        )));
    }
    let header_len = std::mem::size_of::<CheckpointHeader>();
    let mut levels = Vec::new();
    loop {
        let path = level_file(dir, kind, levels.len());
        if !path.exists() {
            break;
        }
        let bytes = fs::read(&path)?;
        if bytes.len() < header_len {
            return Err(ParticleError::parse(&path, 0, "file shorter than its header"));
        }
        let header: CheckpointHeader = bytemuck::pod_read_unaligned(&bytes[..header_len]);
        if header.magic != CHECKPOINT_MAGIC || header.level as usize != levels.len() {
            return Err(ParticleError::parse(&path, 0, "not a particle checkpoint for this level"));
        }
        let payload = &bytes[header_len..];
        let expected = usize::try_from(header.count)
            .ok()
            .and_then(|n| n.checked_mul(std::mem::size_of::<ParticleRecord>()))
            .ok_or_else(|| {
                ParticleError::parse(&path, 0, format!("particle count {} overflows", header.count))
            })?;
        if payload.len() != expected {
            return Err(ParticleError::parse(
                &path,
                header_len,
                format!("payload has {} bytes, header implies {expected}", payload.len()),
            ));
        }
        let records: Vec<ParticleRecord> = bytemuck::pod_collect_to_vec(payload);
        levels.push(records.iter().map(Particle::from).collect());
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("amr-particles-io-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_ascii_reads_records() {
        let dir = scratch("ascii");
        let path = dir.join("dm.txt");
        fs::write(&path, "2\n0.1 0.2 0.3 1.0 0 0 0\n0.5 0.5 0.5\n2.0 1 2 3\n").unwrap();
        let ps = read_ascii(&path, SpeciesKind::DarkMatter).unwrap();
        assert_eq!(ps.len(), 2);
        assert_eq!(ps[1].mass, 2.0);
        assert_eq!(ps[1].vel, DVec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_ascii_truncated_is_parse_error() {
        let dir = scratch("ascii-short");
        let path = dir.join("dm.txt");
        fs::write(&path, "3\n0.1 0.2 0.3 1.0 0 0 0\n").unwrap();
        let err = read_ascii(&path, SpeciesKind::DarkMatter).unwrap_err();
        assert!(matches!(err, ParticleError::Parse { .. }));
    }

    #[test]
    fn test_neutrino_ascii_reads_extra_terms() {
        let dir = scratch("nu");
        let path = dir.join("nu.txt");
        fs::write(&path, "1\n0.1 0.2 0.3 1.0 0.1 0 0 7 8 9\n").unwrap();
        let ps = read_ascii(&path, SpeciesKind::Neutrino).unwrap();
        assert_eq!(ps[0].aux, DVec3::new(7.0, 8.0, 9.0));
    }

    #[test]
    fn test_replicate_tiles_domain() {
        let geom = Geometry::unit_periodic(8);
        let p = Particle::new(0, DVec3::splat(0.1), DVec3::ZERO, 1.0);
        let out = replicate(vec![p], &geom, IVec3::new(2, 1, 1));
        assert_eq!(out.len(), 2);
        assert!((out[1].pos.x - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_binary_header_mismatch() {
        let dir = scratch("bin");
        let path = dir.join("dm.bin");
        let p = Particle::new(0, DVec3::splat(0.25), DVec3::X, 0.5);
        write_binary(&path, SpeciesKind::DarkMatter, &[p]).unwrap();
        assert_eq!(read_binary(&path, SpeciesKind::DarkMatter).unwrap().len(), 1);
        assert!(read_binary(&path, SpeciesKind::Neutrino).is_err());
    }

    #[test]
    fn test_huge_counts_are_parse_errors() {
        let dir = scratch("huge");
        let ascii = dir.join("dm.txt");
        fs::write(&ascii, "18446744073709551615\n0.1 0.2 0.3 1.0 0 0 0\n").unwrap();
        let err = read_ascii(&ascii, SpeciesKind::DarkMatter).unwrap_err();
        assert!(matches!(err, ParticleError::Parse { .. }));

        let bin = dir.join("dm.bin");
        let header = BinaryHeader {
            count: i64::MAX,
            dim: 3,
            n_extra: SpeciesKind::DarkMatter.n_file_reals() as i32,
        };
        fs::write(&bin, bytemuck::bytes_of(&header)).unwrap();
        let err = read_binary(&bin, SpeciesKind::DarkMatter).unwrap_err();
        assert!(matches!(err, ParticleError::Parse { .. }));

        let ckpt = dir.join("ckpt");
        let level0 = level_file(&ckpt, SpeciesKind::DarkMatter, 0);
        fs::create_dir_all(level0.parent().unwrap()).unwrap();
        let header = CheckpointHeader {
            magic: CHECKPOINT_MAGIC,
            level: 0,
            count: u64::MAX,
        };
        fs::write(&level0, bytemuck::bytes_of(&header)).unwrap();
        let err = read_checkpoint(&ckpt, SpeciesKind::DarkMatter).unwrap_err();
        assert!(matches!(err, ParticleError::Parse { .. }));
    }
}
