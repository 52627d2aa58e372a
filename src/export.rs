#![cfg(not(tarpaulin_include))]

use chrono::{DateTime, SecondsFormat, Utc};
use std::error::Error;

use crate::participant::{Checkpoint, Participant};

/// Column order of the participant export
pub const PARTICIPANT_COLUMNS: [&str; 15] = [
    "ID",
    "Name",
    "Email",
    "Phone",
    "Team",
    "College Checked In",
    "College Check-In Time",
    "College Checked Out",
    "College Check-Out Time",
    "Lab Checked In",
    "Lab Check-In Time",
    "Lab Checked Out",
    "Lab Check-Out Time",
    "WiFi Username",
    "WiFi Password",
];

/// Flatten a participant into export cells, in [`PARTICIPANT_COLUMNS`] order
pub fn participant_row(participant: &Participant) -> [String; 15] {
    let [college_in, college_in_at, college_out, college_out_at] =
        checkpoint_cells(&participant.college);
    let [lab_in, lab_in_at, lab_out, lab_out_at] = checkpoint_cells(&participant.lab);
    let (wifi_username, wifi_password) = participant
        .wifi
        .as_ref()
        .map(|wifi| (wifi.username.clone(), wifi.password.clone()))
        .unwrap_or_default();

    [
        participant.id.clone(),
        participant.name.clone(),
        participant.email.clone(),
        participant.phone.clone().unwrap_or_default(),
        participant.team.clone().unwrap_or_default(),
        college_in,
        college_in_at,
        college_out,
        college_out_at,
        lab_in,
        lab_in_at,
        lab_out,
        lab_out_at,
        wifi_username,
        wifi_password,
    ]
}

fn checkpoint_cells(checkpoint: &Checkpoint) -> [String; 4] {
    [
        checkpoint.checked_in.to_string(),
        timestamp(checkpoint.checked_in_at),
        checkpoint.checked_out.to_string(),
        timestamp(checkpoint.checked_out_at),
    ]
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Escape a value for CSV: commas, quotes and newlines force quoting
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r')
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Convert participants to CSV format
///
/// The first line is the fixed [`PARTICIPANT_COLUMNS`] header, followed by
/// exactly one line per participant.
///
/// # Arguments
/// * `participants` - Participants to export, in the order they should appear
///
/// # Returns
/// * `String` - CSV content
pub fn participants_csv(participants: &[Participant]) -> String {
    let mut csv_content = PARTICIPANT_COLUMNS.join(",");
    csv_content.push('\n');

    for participant in participants {
        let row: Vec<String> = participant_row(participant)
            .iter()
            .map(|value| csv_field(value))
            .collect();
        csv_content.push_str(&row.join(","));
        csv_content.push('\n');
    }

    csv_content
}

/// Convert participants to XLSX format
///
/// This exports the same table as [`participants_csv`] using the rust_xlsxwriter
/// library, with a bold header row.
///
/// # Arguments
/// * `participants` - Participants to export
///
/// # Returns
/// * `Result<Vec<u8>, Box<dyn Error + Send + Sync>>` - XLSX file content as bytes or an error
#[cfg(feature = "web")]
pub fn participants_xlsx(participants: &[Participant]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    use rust_xlsxwriter::{Format, Workbook, Worksheet};

    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    worksheet.set_name("Participants")?;

    let header = Format::new().set_bold();
    for (col, title) in PARTICIPANT_COLUMNS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *title, &header)?;
    }

    for (r, participant) in participants.iter().enumerate() {
        for (c, value) in participant_row(participant).iter().enumerate() {
            worksheet.write_string((r + 1) as u32, c as u16, value.as_str())?;
        }
    }

    workbook.push_worksheet(worksheet);

    let buffer = workbook.save_to_buffer()?;

    Ok(buffer)
}

#[cfg(feature = "web")]
pub use web::*;

#[cfg(feature = "web")]
mod web {
    use axum::{
        body::Body,
        extract::State,
        http::{StatusCode, header},
        response::{IntoResponse, Response},
    };
    use chrono::Utc;

    use super::*;
    use crate::app::AppState;
    use crate::error::AppError;

    fn download(content_type: &str, filename: String, body: Vec<u8>) -> Result<Response, AppError> {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            )
            .body(Body::from(body))
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    pub async fn handle_export_csv(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
        let participants = state.store.list::<Participant>().await?;
        let csv = participants_csv(&participants);
        download(
            "text/csv; charset=utf-8",
            format!("participants-{}.csv", Utc::now().format("%Y%m%d-%H%M%S")),
            csv.into_bytes(),
        )
    }

    pub async fn handle_export_xlsx(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
        let participants = state.store.list::<Participant>().await?;
        let xlsx = participants_xlsx(&participants).map_err(|e| AppError::Internal(e.to_string()))?;
        download(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            format!("participants-{}.xlsx", Utc::now().format("%Y%m%d-%H%M%S")),
            xlsx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::WifiCredentials;
    use chrono::TimeZone;

    fn participant(name: &str) -> Participant {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap();
        Participant {
            id: format!("id-{name}"),
            name: name.to_string(),
            email: format!("{}@example.org", name.to_lowercase()),
            phone: None,
            team: Some("Team, Inc".to_string()),
            college: Checkpoint {
                checked_in: true,
                checked_in_at: Some(at),
                checked_out: false,
                checked_out_at: None,
            },
            lab: Checkpoint::default(),
            wifi: Some(WifiCredentials {
                username: "guest".to_string(),
                password: "p\"w".to_string(),
            }),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn csv_has_one_row_per_participant() {
        let participants = vec![participant("Ada"), participant("Grace"), participant("Linus")];
        let csv = participants_csv(&participants);

        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), participants.len() + 1);
        assert!(lines[0].starts_with("ID,Name,Email,Phone,Team,College Checked In"));
        assert!(lines[0].ends_with("WiFi Username,WiFi Password"));
    }

    #[test]
    fn csv_quotes_special_characters() {
        let csv = participants_csv(&[participant("Ada")]);
        let row = csv.lines().nth(1).unwrap();
        assert_eq!(
            row,
            "id-Ada,Ada,ada@example.org,,\"Team, Inc\",true,2026-03-14T09:30:00Z,false,,false,,false,,guest,\"p\"\"w\""
        );
    }

    #[test]
    fn empty_export_is_just_the_header() {
        let csv = participants_csv(&[]);
        assert_eq!(csv, format!("{}\n", PARTICIPANT_COLUMNS.join(",")));
    }

    #[cfg(feature = "web")]
    #[test]
    fn xlsx_has_a_bold_header_and_one_row_per_participant() {
        use std::io::{Cursor, Read};

        let bytes = participants_xlsx(&[participant("Ada"), participant("Grace")]).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut read = |name: &str| {
            let mut content = String::new();
            archive
                .by_name(name)
                .unwrap()
                .read_to_string(&mut content)
                .unwrap();
            content
        };

        let sheet = read("xl/worksheets/sheet1.xml");
        let styles = read("xl/styles.xml");
        let strings = read("xl/sharedStrings.xml");
        let workbook = read("xl/workbook.xml");

        assert_eq!(sheet.matches("<row ").count(), 3);
        assert!(styles.contains("<b/>"));
        assert!(strings.contains("WiFi Password"));
        assert!(strings.contains("grace@example.org"));
        assert!(workbook.contains("name=\"Participants\""));
    }
}
