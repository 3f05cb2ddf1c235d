//! Loading the teach run from its working directory.
//!
//! Text formats, one record per line, whitespace separated, blank lines and
//! `#` comments ignored:
//!
//! - commands (`speeds.sl`): `t lin.x lin.y lin.z ang.x ang.y ang.z`
//! - poses (`positions.pl`): `t x y z qx qy qz qw`
//! - anchor descriptors (`anchorPoints.apd`): one anchor name per line
//! - anchor pose (`<name>.pose`): `x y z qx qy qz qw`
//! - anchor cloud (`<name>.cloud`): `x y z` per point

use std::path::{Path, PathBuf};

use nalgebra::{Point3, Vector3};
use thiserror::Error;

use crate::anchor::AnchorPoint;
use crate::geometry::{pose_from_parts, PointCloud, Pose, Twist};
use crate::trajectory::{Stamped, TimedCommand, TimedPose};

/// Errors reading teach records.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("could not open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{}:{line}: timestamp {stamp} precedes previous record {previous}", path.display())]
    OutOfOrder {
        path: PathBuf,
        line: usize,
        stamp: f64,
        previous: f64,
    },

    #[error("{}: no record found", path.display())]
    Empty { path: PathBuf },
}

fn read(path: &Path) -> Result<String, RecordError> {
    std::fs::read_to_string(path).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Non-empty, non-comment lines with their 1-based line numbers.
fn records(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn fields<const N: usize>(path: &Path, line: usize, text: &str) -> Result<[f64; N], RecordError> {
    let parse_err = |reason: String| RecordError::Parse {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut out = [0.0; N];
    let mut count = 0;
    for token in text.split_whitespace() {
        if count == N {
            return Err(parse_err(format!("expected {} fields, found more", N)));
        }
        let value: f64 = token
            .parse()
            .map_err(|e| parse_err(format!("invalid number {:?}: {}", token, e)))?;
        if !value.is_finite() {
            return Err(parse_err(format!("non-finite number {:?}", token)));
        }
        out[count] = value;
        count += 1;
    }
    if count != N {
        return Err(parse_err(format!("expected {} fields, found {}", N, count)));
    }
    Ok(out)
}

fn check_order(
    path: &Path,
    line: usize,
    stamp: f64,
    previous: Option<f64>,
) -> Result<(), RecordError> {
    match previous {
        Some(previous) if stamp < previous => Err(RecordError::OutOfOrder {
            path: path.to_path_buf(),
            line,
            stamp,
            previous,
        }),
        _ => Ok(()),
    }
}

/// Parse a command log.
pub fn parse_commands(path: &Path, content: &str) -> Result<Vec<TimedCommand>, RecordError> {
    let mut out: Vec<TimedCommand> = Vec::new();
    for (line, text) in records(content) {
        let [t, lx, ly, lz, ax, ay, az] = fields::<7>(path, line, text)?;
        check_order(path, line, t, out.last().map(|c| c.stamp))?;
        out.push(Stamped::new(
            t,
            Twist::new(Vector3::new(lx, ly, lz), Vector3::new(ax, ay, az)),
        ));
    }
    Ok(out)
}

/// Parse a pose log.
pub fn parse_poses(path: &Path, content: &str) -> Result<Vec<TimedPose>, RecordError> {
    let mut out: Vec<TimedPose> = Vec::new();
    for (line, text) in records(content) {
        let [t, x, y, z, qx, qy, qz, qw] = fields::<8>(path, line, text)?;
        check_order(path, line, t, out.last().map(|p| p.stamp))?;
        out.push(Stamped::new(t, pose_from_parts([x, y, z], [qx, qy, qz, qw])));
    }
    Ok(out)
}

pub fn load_commands(path: &Path) -> Result<Vec<TimedCommand>, RecordError> {
    parse_commands(path, &read(path)?)
}

pub fn load_poses(path: &Path) -> Result<Vec<TimedPose>, RecordError> {
    parse_poses(path, &read(path)?)
}

fn load_anchor_pose(path: &Path) -> Result<Pose, RecordError> {
    let content = read(path)?;
    let (line, text) = records(&content)
        .next()
        .ok_or_else(|| RecordError::Empty {
            path: path.to_path_buf(),
        })?;
    let [x, y, z, qx, qy, qz, qw] = fields::<7>(path, line, text)?;
    Ok(pose_from_parts([x, y, z], [qx, qy, qz, qw]))
}

fn load_anchor_cloud(path: &Path) -> Result<PointCloud, RecordError> {
    let content = read(path)?;
    let mut points = Vec::new();
    for (line, text) in records(&content) {
        let [x, y, z] = fields::<3>(path, line, text)?;
        points.push(Point3::new(x, y, z));
    }
    Ok(PointCloud::new(0.0, points))
}

/// Resolve one anchor by name from `dir`.
pub fn load_anchor_point(dir: &Path, name: &str) -> Result<AnchorPoint, RecordError> {
    let pose = load_anchor_pose(&dir.join(format!("{}.pose", name)))?;
    let cloud = load_anchor_cloud(&dir.join(format!("{}.cloud", name)))?;
    Ok(AnchorPoint::new(name, pose, cloud))
}

/// Load the anchor descriptor log and every anchor it names.
///
/// Anchor files are resolved relative to the descriptor's directory.
pub fn load_anchor_points(path: &Path) -> Result<Vec<AnchorPoint>, RecordError> {
    let content = read(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    records(&content)
        .map(|(_, name)| load_anchor_point(dir, name))
        .collect()
}
