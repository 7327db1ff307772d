use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::BadRequest(format!("Validation failed: {errors}")))
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateContractPaymentsInput {
    #[serde(default, rename = "contractId", alias = "contract_id")]
    #[validate(length(max = 128))]
    pub contract_id: Option<String>,
}

impl UpdateContractPaymentsInput {
    /// The trimmed contract id, or 400 when it is missing or blank.
    pub fn require_contract_id(&self) -> Result<String, AppError> {
        self.contract_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| AppError::BadRequest("Contract ID is required".to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractPath {
    pub contract_id: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{validate_input, UpdateContractPaymentsInput};
    use crate::error::AppError;

    fn input(body: serde_json::Value) -> UpdateContractPaymentsInput {
        serde_json::from_value(body).expect("input decodes")
    }

    #[test]
    fn accepts_camel_and_snake_case_ids() {
        let camel = input(json!({ "contractId": " c-1 " }));
        assert_eq!(camel.require_contract_id().expect("id"), "c-1");
        let snake = input(json!({ "contract_id": "c-2" }));
        assert_eq!(snake.require_contract_id().expect("id"), "c-2");
    }

    #[test]
    fn missing_or_blank_id_is_a_bad_request() {
        for body in [json!({}), json!({ "contractId": "   " }), json!({ "contractId": null })] {
            let error = input(body).require_contract_id().expect_err("rejected");
            assert!(matches!(error, AppError::BadRequest(_)));
        }
    }

    #[test]
    fn overlong_id_fails_validation() {
        let long = input(json!({ "contractId": "x".repeat(200) }));
        assert!(matches!(validate_input(&long), Err(AppError::BadRequest(_))));
    }
}
