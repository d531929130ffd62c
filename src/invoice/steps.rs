//! Step and router bodies for the invoice pipeline

use serde_json::{json, Value as JsonValue};

use super::{
    checkpoint_id_for, APPROVED, CHECKPOINT_HITL, FAILED, FINALIZE, INTAKE, MATCHED,
    MATCH_THRESHOLD, REJECTED, STATUS_COMPLETED, STATUS_INGESTED, STATUS_PAUSED,
    STATUS_REJECTED, STATUS_UNRESOLVED,
};
use crate::engine::graph::Next;
use crate::engine::state::StateRecord;
use crate::error::{FlowError, FlowResult};

fn invoice_id(state: &StateRecord) -> &str {
    state
        .payload
        .get("invoice_id")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
}

fn amount_of(value: Option<&JsonValue>) -> Option<f64> {
    value.and_then(JsonValue::as_f64)
}

/// Validate the submitted payload
pub fn intake(mut state: StateRecord) -> FlowResult<StateRecord> {
    if invoice_id(&state).is_empty() {
        return Err(FlowError::step(INTAKE, "payload has no invoice_id"));
    }
    match amount_of(state.payload.get("amount")) {
        Some(amount) if amount >= 0.0 => {}
        _ => {
            return Err(FlowError::step(
                INTAKE,
                "payload amount must be a non-negative number",
            ))
        }
    }

    state.status = STATUS_INGESTED.to_string();
    state.trace.record("INTAKE: Payload validated and stored");
    Ok(state)
}

/// Extract the fields later steps work on
pub fn understand(mut state: StateRecord) -> FlowResult<StateRecord> {
    let mut parsed = serde_json::Map::new();
    for key in ["invoice_id", "amount", "vendor", "currency"] {
        if let Some(value) = state.payload.get(key) {
            parsed.insert(key.to_string(), value.clone());
        }
    }
    state.derived.insert("parsed_invoice".to_string(), parsed);
    state.trace.record("UNDERSTAND: Invoice fields parsed");
    Ok(state)
}

/// Normalize the vendor and attach risk flags
pub fn prepare(mut state: StateRecord) -> FlowResult<StateRecord> {
    let vendor = state
        .payload
        .get("vendor")
        .and_then(JsonValue::as_str)
        .unwrap_or("ACME Corp");
    let normalized: String = vendor
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();

    state
        .derived_mut("vendor_profile")
        .insert("normalized_name".to_string(), json!(normalized));
    state
        .derived_mut("flags")
        .insert("risk_score".to_string(), json!(0.2));
    state.trace.record("PREPARE: Vendor normalized and enriched");
    Ok(state)
}

/// Look up the matching purchase order
///
/// The purchase order travels inside the payload as `purchase_order`; a real
/// deployment would query the ERP here.
pub fn retrieve(mut state: StateRecord) -> FlowResult<StateRecord> {
    let entry = match state.payload.get("purchase_order") {
        Some(JsonValue::Object(po)) => {
            let mut erp = po.clone();
            erp.insert("found".to_string(), json!(true));
            erp
        }
        _ => {
            let mut erp = serde_json::Map::new();
            erp.insert("found".to_string(), json!(false));
            erp
        }
    };

    let found = entry.get("found").and_then(JsonValue::as_bool).unwrap_or(false);
    state.derived.insert("erp".to_string(), entry);
    state.trace.record(if found {
        "RETRIEVE: Purchase order fetched"
    } else {
        "RETRIEVE: No purchase order on file"
    });
    Ok(state)
}

/// Compare invoice and purchase order amounts
///
/// The score is the ratio of the smaller amount to the larger one, and 0.0
/// when no purchase order amount is available.
pub fn match_two_way(mut state: StateRecord) -> FlowResult<StateRecord> {
    let invoice_amount = amount_of(state.payload.get("amount"));
    let po_amount = amount_of(state.derived("erp").and_then(|erp| erp.get("amount")));

    let score = match (invoice_amount, po_amount) {
        (Some(a), Some(b)) => {
            let high = a.max(b);
            if high == 0.0 {
                1.0
            } else {
                a.min(b) / high
            }
        }
        _ => 0.0,
    };

    state.score = score;
    let decision = if score < MATCH_THRESHOLD { FAILED } else { MATCHED };
    state.decision = decision.to_string();
    state.trace.record(format!(
        "MATCH_TWO_WAY: score={:.2} result={}",
        state.score, state.decision
    ));
    Ok(state)
}

/// Pause the invoice for human review
pub fn checkpoint_hitl(mut state: StateRecord) -> FlowResult<StateRecord> {
    let checkpoint_id = checkpoint_id_for(invoice_id(&state));
    state.suspend(checkpoint_id, STATUS_PAUSED);
    state
        .trace
        .record("CHECKPOINT_HITL: Workflow paused for human review");
    Ok(state)
}

/// Settle the final status from the decision
pub fn finalize(mut state: StateRecord) -> FlowResult<StateRecord> {
    state.status = match state.decision.as_str() {
        MATCHED | APPROVED => STATUS_COMPLETED,
        REJECTED => STATUS_REJECTED,
        _ => STATUS_UNRESOLVED,
    }
    .to_string();
    state.trace.record(format!(
        "FINALIZE: decision={} status={}",
        state.decision, state.status
    ));
    Ok(state)
}

/// Send failed matches to review, everything else straight to finalization
pub fn route_after_match(state: &StateRecord) -> Next {
    if state.decision == FAILED {
        Next::step(CHECKPOINT_HITL)
    } else {
        Next::step(FINALIZE)
    }
}
