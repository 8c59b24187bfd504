use std::io;
use std::path::Path;

use serde::Serialize;

use crate::dedup::DuplicateGroup;
use crate::errors::AppResult;

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    group: usize,
    key: &'a str,
    position: usize,
    id: i64,
    name_local: Option<&'a str>,
    name_english: Option<&'a str>,
    lat: Option<f64>,
    lng: Option<f64>,
    keep: bool,
}

/// One row per group member. The first member of a group (lowest id) is the
/// one marked `keep`.
pub fn write_report<W: io::Write>(writer: W, groups: &[DuplicateGroup]) -> AppResult<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for (group_index, group) in groups.iter().enumerate() {
        for (position, member) in group.members.iter().enumerate() {
            let point = member.coordinates();
            csv.serialize(ReportRow {
                group: group_index + 1,
                key: &group.key,
                position: position + 1,
                id: member.id,
                name_local: member.name_local.as_deref(),
                name_english: member.name_english.as_deref(),
                lat: point.map(|p| p.lat()),
                lng: point.map(|p| p.lng()),
                keep: position == 0,
            })?;
            rows += 1;
        }
    }
    csv.flush()?;
    Ok(rows)
}

pub fn write_report_file(path: &Path, groups: &[DuplicateGroup]) -> AppResult<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    write_report(file, groups)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::dedup::group_duplicates;
    use crate::records::LocationRecord;

    fn at(id: i64, name: &str, lat: f64, lng: f64) -> LocationRecord {
        LocationRecord {
            id,
            name_local: Some(name.to_string()),
            lat: Some(lat),
            lng: Some(lng),
            ..LocationRecord::default()
        }
    }

    #[test]
    fn writes_one_row_per_member_and_keeps_the_lowest_id() {
        let groups = group_duplicates(
            vec![
                at(9, "Blue Lagoon", 63.88, -22.45),
                at(4, "Blue Lagoon, Grindavik", 63.88, -22.45),
            ],
            0.0,
        );
        let mut buffer = Vec::new();
        let rows = write_report(&mut buffer, &groups).unwrap();
        assert_eq!(rows, 2);

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "group,key,position,id,name_local,name_english,lat,lng,keep"
        );
        assert!(lines[1].starts_with("1,\"63.880000,-22.450000\",1,4,"));
        assert!(lines[1].ends_with(",true"));
        assert!(lines[2].contains(",9,Blue Lagoon,"));
        assert!(lines[2].ends_with(",false"));
    }

    #[test]
    fn writes_to_a_new_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports").join("duplicates.csv");
        let rows = write_report_file(&path, &[]).unwrap();
        assert_eq!(rows, 0);
        assert!(path.exists());
    }
}
