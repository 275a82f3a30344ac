//! Human-readable route names.

use std::collections::HashMap;

use crate::types::RouteRef;

/// `route_id` → display name.
#[derive(Debug, Clone, Default)]
pub struct RouteNames {
    names: HashMap<String, String>,
}

impl RouteNames {
    /// Short names are used as-is unless several routes share one; those get
    /// their long name appended, or the route id when there is none.
    pub fn from_routes(routes: &[RouteRef]) -> Self {
        let mut uses: HashMap<&str, usize> = HashMap::new();
        for r in routes {
            *uses.entry(r.route_short_name.as_str()).or_default() += 1;
        }

        let names = routes
            .iter()
            .map(|r| {
                let short = r.route_short_name.as_str();
                let name = if uses[short] > 1 {
                    let long = r
                        .route_long_name
                        .as_deref()
                        .filter(|l| !l.is_empty())
                        .unwrap_or(&r.route_id);
                    format!("{short} ({long})")
                } else {
                    short.to_string()
                };
                (r.route_id.clone(), name)
            })
            .collect();
        RouteNames { names }
    }

    pub fn get(&self, route_id: &str) -> Option<&str> {
        self.names.get(route_id).map(String::as_str)
    }

    /// Display name, or the raw id for routes missing from the table.
    pub fn label<'a>(&'a self, route_id: &'a str) -> &'a str {
        self.get(route_id).unwrap_or(route_id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, short: &str, long: Option<&str>) -> RouteRef {
        RouteRef {
            route_id: id.into(),
            route_short_name: short.into(),
            route_long_name: long.map(Into::into),
        }
    }

    #[test]
    fn test_shared_short_names_are_disambiguated() {
        let names = RouteNames::from_routes(&[
            route("r1", "39A", Some("Ongar - UCD")),
            route("r2", "39A", Some("Night Link")),
            route("r3", "46A", Some("Phoenix Park - Dun Laoghaire")),
        ]);
        assert_eq!(names.get("r1"), Some("39A (Ongar - UCD)"));
        assert_eq!(names.get("r2"), Some("39A (Night Link)"));
        assert_eq!(names.get("r3"), Some("46A"));
    }

    #[test]
    fn test_missing_long_name_falls_back_to_id() {
        let names = RouteNames::from_routes(&[route("r1", "C1", None), route("r2", "C1", Some(""))]);
        assert_eq!(names.get("r1"), Some("C1 (r1)"));
        assert_eq!(names.get("r2"), Some("C1 (r2)"));
    }

    #[test]
    fn test_unknown_route_label() {
        let names = RouteNames::default();
        assert!(names.is_empty());
        assert_eq!(names.label("x9"), "x9");
    }
}
