use serde::{Deserialize, Serialize};

/// Une règle de routage : la métrique `metric` part vers l'équipement dont l'id commence par `prefix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub metric: String,
    pub prefix: String,
}

impl Route {
    pub fn new(metric: &str, prefix: &str) -> Self {
        Self { metric: metric.to_string(), prefix: prefix.to_string() }
    }
}

/// Table plate metric → préfixe d'équipement, première règle gagnante
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Résout l'équipement cible ; parmi plusieurs candidats, l'id le plus petit gagne
    pub fn resolve<'a, I>(&self, metric_name: &str, known_devices: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let route = self.routes.iter().find(|r| r.metric == metric_name)?;
        known_devices
            .into_iter()
            .filter(|id| id.starts_with(route.prefix.as_str()))
            .min()
            .map(str::to_string)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(default_routes())
    }
}

pub fn default_routes() -> Vec<Route> {
    vec![
        Route::new("FLOOR", "ele_"),
        Route::new("MOTOR", "cur_"),
        Route::new("MODE", "dht_"),
    ]
}
