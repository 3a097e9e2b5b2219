use dicom::core::chrono::{Duration, NaiveDate};

/// Anonymized date used when the source date is invalid or the PatientID
/// is blank.
pub const DEFAULT_ANON_DATE: &str = "20000101";

/// Date shifts are bounded by ten years in days.
const DATE_DELTA_MODULUS: u128 = 3652;

/// A DICOM date is valid when it is YYYYMMDD and not before 1900-01-01.
pub fn valid_dicom_date(date: &str) -> bool {
    if date.len() != 8 {
        return false;
    }
    match NaiveDate::parse_from_str(date, "%Y%m%d") {
        Ok(parsed) => {
            let epoch = NaiveDate::from_ymd_opt(1900, 1, 1).expect("valid epoch date");
            parsed >= epoch
        }
        Err(_) => false,
    }
}

/// Shift `date` forward by a number of days derived from the MD5 hash of
/// the patient ID, modulo ten years. The same patient always receives the
/// same shift, preserving longitudinal intervals across studies.
///
/// Returns `(0, "20000101")` when the date is invalid or the patient ID
/// is empty.
pub fn hash_date(date: &str, patient_id: &str) -> (i64, String) {
    if !valid_dicom_date(date) || patient_id.is_empty() {
        return (0, DEFAULT_ANON_DATE.to_string());
    }
    let digest = md5::compute(patient_id.as_bytes());
    let days = (u128::from_be_bytes(digest.0) % DATE_DELTA_MODULUS) as i64;
    let parsed = match NaiveDate::parse_from_str(date, "%Y%m%d") {
        Ok(d) => d,
        Err(_) => return (0, DEFAULT_ANON_DATE.to_string()),
    };
    let shifted = parsed + Duration::days(days);
    (days, shifted.format("%Y%m%d").to_string())
}

/// Anonymized UID for an allocation ordinal: `{uid_root}.{site_id}.{n}`.
pub fn format_anon_uid(uid_root: &str, site_id: &str, ordinal: u64) -> String {
    format!("{uid_root}.{site_id}.{ordinal}")
}

/// Anonymized patient ID for an allocation ordinal: `{site_id}-NNNNNN`.
pub fn format_anon_patient_id(site_id: &str, ordinal: u64) -> String {
    format!("{site_id}-{ordinal:06}")
}
