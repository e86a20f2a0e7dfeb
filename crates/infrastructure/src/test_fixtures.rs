use auditflow_domain::{Action, ActionInput, ActionParty, ActionStatus, EntityRef, PropertyChange};
use chrono::{TimeZone, Utc};
use serde_json::json;

pub(crate) fn sample_action(target_external_id: &str) -> Action {
    Action::new(ActionInput {
        uid: None,
        parent_uid: None,
        name: "invoice.paid".to_owned(),
        hash: "9F86D081884C7D65".to_owned(),
        actor: ActionParty::new("billing", Some(EntityRef::new("operator", "operator-7"))),
        target: ActionParty::new(
            "ledger",
            Some(EntityRef::new("invoice", target_external_id)),
        ),
        status: ActionStatus::Success,
        is_async: true,
        emitted_at: Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
        registered_at: Utc::now(),
        details: json!({"channel": "card"}),
        changes: vec![
            PropertyChange::new("state", Some("open".to_owned()), Some("paid".to_owned())),
            PropertyChange::new("paid_at", None, Some("2024-05-01".to_owned())),
        ],
    })
    .unwrap_or_else(|error| panic!("sample action is invalid: {error}"))
}
