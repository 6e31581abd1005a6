use crate::limits::*;
use crate::model::ClaimRequest;

use super::FieldError;

pub(crate) fn validate_claim(req: &ClaimRequest) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    check_id(&mut errors, "slotId", &req.slot_id, MAX_SLOT_ID_LEN);
    check_id(&mut errors, "candidateId", &req.candidate_id, MAX_CANDIDATE_ID_LEN);

    if req.ttl_secs == 0 {
        errors.push(FieldError::new("ttlSeconds", "must be greater than zero"));
    } else if req.ttl_secs > MAX_HOLD_TTL_SECS {
        errors.push(FieldError::new(
            "ttlSeconds",
            format!("must be at most {MAX_HOLD_TTL_SECS}"),
        ));
    }

    if req.alternatives.len() > MAX_ALTERNATIVES {
        errors.push(FieldError::new(
            "alternatives",
            format!("at most {MAX_ALTERNATIVES} entries allowed"),
        ));
    }
    if let Some(pos) = req.alternatives.iter().position(|a| a.is_empty()) {
        errors.push(FieldError::new("alternatives", format!("entry {pos} is empty")));
    }
    if req.alternatives.iter().any(|a| a.len() > MAX_SLOT_ID_LEN) {
        errors.push(FieldError::new(
            "alternatives",
            format!("entries must be at most {MAX_SLOT_ID_LEN} bytes"),
        ));
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_id(errors: &mut Vec<FieldError>, field: &'static str, value: &str, max_len: usize) {
    if value.is_empty() {
        errors.push(FieldError::new(field, "required"));
    } else if value.len() > max_len {
        errors.push(FieldError::new(field, format!("must be at most {max_len} bytes")));
    }
}
