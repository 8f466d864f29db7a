//! Example client tool offered to the agent with `--secret-menu`.

use chrono::{Local, NaiveDate};
use serde_json::{Value, json};
use ultravox_realtime::{RegistryError, ToolRegistry, tool_fn};

pub const SECRET_MENU_TOOL: &str = "getSecretMenu";

/// Today's secret menu. Takes no parameters.
pub fn secret_menu(today: NaiveDate) -> Value {
    json!([{
        "date": today.format("%Y-%m-%d").to_string(),
        "items": [
            { "name": "Banana Smoothie", "price": "$4.99" },
            { "name": "Butter Pecan Ice Cream (one scoop)", "price": "$2.99" },
        ],
    }])
}

pub fn register_secret_menu(registry: &ToolRegistry) -> Result<(), RegistryError> {
    registry.register(
        SECRET_MENU_TOOL,
        tool_fn(|_| Ok(secret_menu(Local::now().date_naive()))),
        "Looks up today's secret menu items.",
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ultravox_realtime::Parameters;

    #[test]
    fn test_secret_menu_contents() {
        let menu = secret_menu(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(menu[0]["date"], "2024-05-01");
        assert_eq!(menu[0]["items"].as_array().unwrap().len(), 2);
        assert_eq!(menu[0]["items"][0]["name"], "Banana Smoothie");
        assert_eq!(menu[0]["items"][1]["price"], "$2.99");
    }

    #[tokio::test]
    async fn test_register_secret_menu() {
        let registry = ToolRegistry::new();
        register_secret_menu(&registry).unwrap();

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, SECRET_MENU_TOOL);
        assert_eq!(listed[0].description, "Looks up today's secret menu items.");

        let menu = registry
            .execute(SECRET_MENU_TOOL, Parameters::new())
            .await
            .unwrap();
        assert_eq!(menu[0]["items"][0]["price"], "$4.99");

        assert!(matches!(
            register_secret_menu(&registry).unwrap_err(),
            RegistryError::AlreadyRegistered(_)
        ));
    }
}
