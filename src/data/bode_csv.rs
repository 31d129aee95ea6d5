//! Bode sweep export.
//!
//! Layout: optional `# key = value` metadata lines, then the header
//! `index,f_hz,us_v,gain_linear,gain_db` and one row per point. Floats are written in
//! their shortest round-trip form.

use crate::bode::BodePoint;
use crate::error::BenchResult;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

/// Points read back from an export, with their metadata in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodeTable {
    pub metadata: Vec<(String, String)>,
    pub points: Vec<BodePoint>,
}

impl BodeTable {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Write metadata and points to `out`.
pub fn write_bode_csv<W: Write>(
    mut out: W,
    metadata: &[(String, String)],
    points: &[BodePoint],
) -> BenchResult<()> {
    for (key, value) in metadata {
        writeln!(out, "# {key} = {value}")?;
    }

    let mut writer = csv::Writer::from_writer(out);
    for point in points {
        writer.serialize(point)?;
    }
    if points.is_empty() {
        writer.write_record(["index", "f_hz", "us_v", "gain_linear", "gain_db"])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write an export to `path`, replacing any existing file.
pub fn save_bode_csv(
    path: &Path,
    metadata: &[(String, String)],
    points: &[BodePoint],
) -> BenchResult<()> {
    let file = File::create(path)?;
    write_bode_csv(BufWriter::new(file), metadata, points)?;
    info!(path = %path.display(), points = points.len(), "Bode sweep exported");
    Ok(())
}

/// Parse an export. Header cells may be padded with spaces.
pub fn read_bode_csv<R: Read>(mut input: R) -> BenchResult<BodeTable> {
    let mut text = String::new();
    input.read_to_string(&mut text)?;

    let mut metadata = Vec::new();
    let mut body_start = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if let Some(entry) = trimmed.strip_prefix('#') {
            if let Some((key, value)) = entry.split_once('=') {
                metadata.push((key.trim().to_string(), value.trim().to_string()));
            }
        } else if !trimmed.is_empty() {
            break;
        }
        body_start += line.len();
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(text[body_start..].as_bytes());
    let points = reader
        .deserialize::<BodePoint>()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BodeTable { metadata, points })
}

pub fn load_bode_csv(path: &Path) -> BenchResult<BodeTable> {
    read_bode_csv(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Vec<(String, String)> {
        vec![
            ("channel".into(), "1".into()),
            ("u_e".into(), "1".into()),
            ("scale".into(), "log10".into()),
        ]
    }

    #[test]
    fn layout_has_metadata_then_header() {
        let points = vec![BodePoint::new(0, 100.0, 1.0, 0.5)];
        let mut out = Vec::new();
        write_bode_csv(&mut out, &meta(), &points).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines[0], "# channel = 1");
        assert_eq!(lines[2], "# scale = log10");
        assert_eq!(lines[3], "index,f_hz,us_v,gain_linear,gain_db");
        assert!(lines[4].starts_with("0,100.0,0.5,0.5,-6.02"));
    }

    #[test]
    fn reads_back_identical_points() {
        let points: Vec<_> = (0..7)
            .map(|i| {
                let f = 100.0 * 10f64.powf(f64::from(i) / 3.0);
                BodePoint::new(i as usize, f, 1.0, 1.0 / (1.0 + (f / 1234.5).powi(2)).sqrt())
            })
            .collect();
        let mut out = Vec::new();
        write_bode_csv(&mut out, &meta(), &points).unwrap();

        let table = read_bode_csv(out.as_slice()).unwrap();
        assert_eq!(table.points, points);
        assert_eq!(table.metadata_value("scale"), Some("log10"));
        assert_eq!(table.metadata_value("missing"), None);
    }

    #[test]
    fn tolerates_spaced_header() {
        let text = "index, f_hz, us_v, gain_linear, gain_db\n0, 1000, 0.7071, 0.7071, -3.0103\n";
        let table = read_bode_csv(text.as_bytes()).unwrap();
        assert!(table.metadata.is_empty());
        assert_eq!(table.points[0].frequency_hz, 1000.0);
        assert_eq!(table.points[0].gain_db, -3.0103);
    }

    #[test]
    fn empty_sweep_still_has_header() {
        let mut out = Vec::new();
        write_bode_csv(&mut out, &[], &[]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "index,f_hz,us_v,gain_linear,gain_db\n"
        );
    }
}
