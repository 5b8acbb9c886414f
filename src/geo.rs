//! Geo lookup collaborator
//!
//! The lookup service itself lives outside this crate; the server only
//! needs something implementing [`GeoLookup`].

use crate::error::GeoError;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;

/// Location information for a client address
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeoInfo {
    pub city: String,
    pub city_id: i64,
    pub province: String,
    pub region: String,
    pub isp: String,
}

impl GeoInfo {
    /// Value of a `region_*` field
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "city" => Some(self.city.clone()),
            "city_id" => Some(self.city_id.to_string()),
            "province" => Some(self.province.clone()),
            "region" => Some(self.region.clone()),
            "isp" => Some(self.isp.clone()),
            _ => None,
        }
    }

    /// JSON encoding used by the `region_raw` variable
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError>;
}

/// Fixed address table, for tests and small deployments
#[derive(Debug, Default)]
pub struct StaticGeo {
    entries: HashMap<IpAddr, GeoInfo>,
}

impl StaticGeo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, info: GeoInfo) -> Self {
        self.entries.insert(ip, info);
        self
    }
}

impl GeoLookup for StaticGeo {
    fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        self.entries.get(&ip).cloned().ok_or_else(|| GeoError {
            ip: ip.to_string(),
            message: "address not in table".to_string(),
        })
    }
}
