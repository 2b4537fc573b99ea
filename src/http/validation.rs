//! Positive body validation.
//!
//! Every mutating route declares its fields; a request body passes only if
//! each declared field that is present has the declared shape and every
//! required field is present. Monetary amounts must be positive integers.

use serde_json::Value;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Str,
    /// Positive integer in minor units.
    Amount,
    Int,
    Bool,
    Number,
    Object,
    Uuid,
    /// One of an explicit set.
    StrEnum(&'static [&'static str]),
    /// Array of objects validated by the caller.
    Array,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

pub fn validate_body(spec: &[FieldSpec], body: &Value) -> Result<()> {
    let Some(map) = body.as_object() else {
        return Err(LedgerError::InvalidArgument(
            "request body must be a JSON object".to_string(),
        ));
    };
    for field in spec {
        match map.get(field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(LedgerError::InvalidArgument(format!(
                        "missing required field: {}",
                        field.name
                    )));
                }
            }
            Some(value) => validate_field(field, value)?,
        }
    }
    Ok(())
}

fn validate_field(field: &FieldSpec, value: &Value) -> Result<()> {
    let ok = match field.kind {
        FieldKind::Str => value.as_str().is_some_and(|s| !s.is_empty()),
        FieldKind::Amount => value.as_i64().is_some_and(|n| n > 0),
        FieldKind::Int => value.as_i64().is_some(),
        FieldKind::Bool => value.is_boolean(),
        FieldKind::Number => value.as_f64().is_some(),
        FieldKind::Object => value.is_object(),
        FieldKind::Uuid => value
            .as_str()
            .is_some_and(|s| uuid::Uuid::parse_str(s).is_ok()),
        FieldKind::StrEnum(allowed) => value.as_str().is_some_and(|s| allowed.contains(&s)),
        FieldKind::Array => value.is_array(),
    };
    if !ok {
        return Err(LedgerError::InvalidArgument(format!(
            "invalid value for field: {}",
            field.name
        )));
    }
    Ok(())
}

// Route field specs, shared by the dispatcher.

pub const CREATE_ACCOUNT: &[FieldSpec] = &[
    FieldSpec::required("holderId", FieldKind::Str),
    FieldSpec::required(
        "holderType",
        FieldKind::StrEnum(&["individual", "organization", "system"]),
    ),
    FieldSpec::optional("currency", FieldKind::Str),
    FieldSpec::optional("allowOverdraft", FieldKind::Bool),
    FieldSpec::optional("overdraftLimit", FieldKind::Int),
    FieldSpec::optional("metadata", FieldKind::Object),
];

pub const FREEZE: &[FieldSpec] = &[
    FieldSpec::required("reason", FieldKind::Str),
    FieldSpec::required("frozenBy", FieldKind::Str),
];

pub const UNFREEZE: &[FieldSpec] = &[
    FieldSpec::required("unfrozenBy", FieldKind::Str),
    FieldSpec::optional("reason", FieldKind::Str),
];

pub const CLOSE: &[FieldSpec] = &[
    FieldSpec::required("closedBy", FieldKind::Str),
    FieldSpec::optional("reason", FieldKind::Str),
    FieldSpec::optional("transferToHolderId", FieldKind::Str),
];

pub const CREDIT: &[FieldSpec] = &[
    FieldSpec::required("holderId", FieldKind::Str),
    FieldSpec::required("amount", FieldKind::Amount),
    FieldSpec::required("reference", FieldKind::Str),
    FieldSpec::optional("description", FieldKind::Str),
    FieldSpec::optional("sourceSystemAccount", FieldKind::Str),
    FieldSpec::optional("idempotencyKey", FieldKind::Str),
    FieldSpec::optional("metadata", FieldKind::Object),
];

pub const DEBIT: &[FieldSpec] = &[
    FieldSpec::required("holderId", FieldKind::Str),
    FieldSpec::required("amount", FieldKind::Amount),
    FieldSpec::required("reference", FieldKind::Str),
    FieldSpec::optional("description", FieldKind::Str),
    FieldSpec::optional("destinationSystemAccount", FieldKind::Str),
    FieldSpec::optional("allowOverdraft", FieldKind::Bool),
    FieldSpec::optional("idempotencyKey", FieldKind::Str),
    FieldSpec::optional("metadata", FieldKind::Object),
];

pub const TRANSFER: &[FieldSpec] = &[
    FieldSpec::required("sourceHolderId", FieldKind::Str),
    FieldSpec::required("destinationHolderId", FieldKind::Str),
    FieldSpec::required("amount", FieldKind::Amount),
    FieldSpec::required("reference", FieldKind::Str),
    FieldSpec::optional("description", FieldKind::Str),
    FieldSpec::optional("exchangeRate", FieldKind::Number),
    FieldSpec::optional("idempotencyKey", FieldKind::Str),
    FieldSpec::optional("metadata", FieldKind::Object),
];

pub const MULTI_TRANSFER: &[FieldSpec] = &[
    FieldSpec::required("sourceHolderId", FieldKind::Str),
    FieldSpec::required("destinations", FieldKind::Array),
    FieldSpec::required("reference", FieldKind::Str),
    FieldSpec::optional("amount", FieldKind::Amount),
    FieldSpec::optional("description", FieldKind::Str),
    FieldSpec::optional("idempotencyKey", FieldKind::Str),
];

pub const REFUND: &[FieldSpec] = &[
    FieldSpec::required("transactionId", FieldKind::Uuid),
    FieldSpec::required("reason", FieldKind::Str),
    FieldSpec::optional("amount", FieldKind::Amount),
    FieldSpec::optional("idempotencyKey", FieldKind::Str),
];

pub const HOLD: &[FieldSpec] = &[
    FieldSpec::required("holderId", FieldKind::Str),
    FieldSpec::required("amount", FieldKind::Amount),
    FieldSpec::required("reference", FieldKind::Str),
    FieldSpec::optional("destinationHolderId", FieldKind::Str),
    FieldSpec::optional("expiresInMinutes", FieldKind::Int),
    FieldSpec::optional("idempotencyKey", FieldKind::Str),
    FieldSpec::optional("metadata", FieldKind::Object),
];

pub const HOLD_COMMIT: &[FieldSpec] = &[FieldSpec::optional("amount", FieldKind::Amount)];

pub const HOLD_VOID: &[FieldSpec] = &[FieldSpec::optional("reason", FieldKind::Str)];

pub const VERIFY_EVENTS: &[FieldSpec] = &[
    FieldSpec::required("aggregateType", FieldKind::Str),
    FieldSpec::required("aggregateId", FieldKind::Str),
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_fields_are_enforced() {
        let body = json!({"holderId": "H1"});
        let err = validate_body(CREATE_ACCOUNT, &body).unwrap_err();
        assert!(err.to_string().contains("holderType"));

        let body = json!({"holderId": "H1", "holderType": "individual"});
        validate_body(CREATE_ACCOUNT, &body).unwrap();
    }

    #[test]
    fn enums_are_checked_against_the_explicit_set() {
        let body = json!({"holderId": "H1", "holderType": "robot"});
        assert!(validate_body(CREATE_ACCOUNT, &body).is_err());
    }

    #[test]
    fn amounts_must_be_positive_integers() {
        for bad in [json!(0), json!(-100), json!(10.5), json!("100")] {
            let body = json!({"holderId": "H1", "amount": bad, "reference": "r1"});
            assert!(validate_body(CREDIT, &body).is_err(), "{bad}");
        }
        let body = json!({"holderId": "H1", "amount": 100, "reference": "r1"});
        validate_body(CREDIT, &body).unwrap();
    }

    #[test]
    fn optional_fields_may_be_absent_or_null_but_not_malformed() {
        let body = json!({"holderId": "H1", "amount": 100, "reference": "r1", "description": null});
        validate_body(CREDIT, &body).unwrap();
        let body = json!({"holderId": "H1", "amount": 100, "reference": "r1", "description": 7});
        assert!(validate_body(CREDIT, &body).is_err());
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        assert!(validate_body(CREDIT, &json!([1, 2])).is_err());
        assert!(validate_body(CREDIT, &json!("x")).is_err());
    }

    #[test]
    fn uuid_fields_are_parsed() {
        let body = json!({"transactionId": "not-a-uuid", "reason": "dup"});
        assert!(validate_body(REFUND, &body).is_err());
        let body = json!({
            "transactionId": uuid::Uuid::new_v4().to_string(),
            "reason": "dup",
        });
        validate_body(REFUND, &body).unwrap();
    }
}
