use serde::{Deserialize, Deserializer, Serialize};
use crate::modules::error::RelayError;

// A single contact-form submission as entered by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPayload {
    // Full name of the sender
    pub name: String,
    // Optional reply address, the form sends "" when it is left empty
    #[serde(default, deserialize_with = "blank_as_none")]
    pub email: Option<String>,
    // Phone number, the main contact channel
    pub phone: String,
    // Amount to transfer, kept as entered
    pub amount: String,
    // Optional free-form message
    #[serde(default, deserialize_with = "blank_as_none")]
    pub message: Option<String>,
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|text| !text.trim().is_empty()))
}

impl ContactPayload {
    // Same submission with empty optional fields dropped
    pub fn normalized(mut self) -> Self {
        self.email = self.email.filter(|text| !text.trim().is_empty());
        self.message = self.message.filter(|text| !text.trim().is_empty());
        self
    }

    // Amount as a number, if the entered text is one
    pub fn amount_value(&self) -> Option<f64> {
        self.amount.trim().parse::<f64>().ok()
    }

    // Body sent to the contact endpoint. The backend declares `amount` as a float,
    // so it goes out as a number whenever it parses as one
    pub fn to_request_body(&self) -> serde_json::Value {
        let amount = match self.amount_value() {
            Some(value) => serde_json::json!(value),
            None => serde_json::json!(self.amount),
        };
        serde_json::json!({
            "name": self.name,
            "email": self.email,
            "phone": self.phone,
            "amount": amount,
            "message": self.message,
        })
    }
}

// Validate a payload against the contact schema.
// Deterministically invalid payloads must not end up in the offline queue.
// The check runs on the request body, so `amount` is judged as the number the backend receives
pub fn validate_payload(payload: &ContactPayload) -> Result<(), RelayError> {

    // Initiate the control schema, the amount bound follows the form's min="1"
    let control_schema = serde_json::json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "minLength": 1, "pattern": "\\S" },
            "email": {
                "type": ["string", "null"],
                "pattern": "^[^@\\s]+@[^@\\s]+\\.[^@\\s]+$"
            },
            "phone": { "type": "string", "minLength": 1, "pattern": "[0-9]" },
            "amount": { "type": "number", "minimum": 1 },
            "message": { "type": ["string", "null"] }
        },
        "required": ["name", "phone", "amount"]
    });

    let json_data = payload.to_request_body();

    // Validate the JSON data against the control schema
    match jsonschema::validate(&control_schema, &json_data) {
        Ok(_) => Ok(()),
        Err(e) => Err(RelayError::ValidationError(e.to_string())),
    }
}

#[cfg(test)]
pub(crate) fn sample_payload(name: &str) -> ContactPayload {
    ContactPayload {
        name: name.to_string(),
        email: Some(format!("{}@example.com", name.to_lowercase())),
        phone: "+1-347-864-6398".to_string(),
        amount: "1000".to_string(),
        message: Some("Necesito enviar dinero a mi familia".to_string()),
    }
}
