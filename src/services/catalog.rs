use crate::{db::Database, error::Result};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub cities: Vec<CityEntry>,
}

#[derive(Debug, Clone)]
pub struct CityEntry {
    pub name: String,
    pub districts: Vec<DistrictEntry>,
}

#[derive(Debug, Clone)]
pub struct DistrictEntry {
    pub name: String,
    pub types: Vec<String>,
}

/// Shop geography handle, built at boot from the products table and
/// refreshed on admin catalog writes. Callback data references cities and
/// districts by index into this snapshot, so indices stay stable between
/// admin mutations.
pub struct Catalog {
    db: Database,
    snapshot: RwLock<CatalogSnapshot>,
}

impl Catalog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            snapshot: RwLock::new(CatalogSnapshot::default()),
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT DISTINCT city, district, product_type FROM products
             ORDER BY city ASC, district ASC, product_type ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut cities: Vec<CityEntry> = Vec::new();
        for (city, district, product_type) in rows {
            let city_entry = match cities.iter_mut().find(|c| c.name == city) {
                Some(entry) => entry,
                None => {
                    cities.push(CityEntry {
                        name: city,
                        districts: Vec::new(),
                    });
                    cities.last_mut().expect("just pushed")
                }
            };
            let district_entry = match city_entry
                .districts
                .iter_mut()
                .find(|d| d.name == district)
            {
                Some(entry) => entry,
                None => {
                    city_entry.districts.push(DistrictEntry {
                        name: district,
                        types: Vec::new(),
                    });
                    city_entry.districts.last_mut().expect("just pushed")
                }
            };
            if !district_entry.types.contains(&product_type) {
                district_entry.types.push(product_type);
            }
        }

        let mut snapshot = self.snapshot.write().await;
        snapshot.cities = cities;
        tracing::debug!("Catalog refreshed: {} city(ies)", snapshot.cities.len());
        Ok(())
    }

    pub async fn snapshot(&self) -> CatalogSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn city(&self, city_idx: usize) -> Option<String> {
        let snapshot = self.snapshot.read().await;
        snapshot.cities.get(city_idx).map(|c| c.name.clone())
    }

    pub async fn district(&self, city_idx: usize, district_idx: usize) -> Option<(String, String)> {
        let snapshot = self.snapshot.read().await;
        let city = snapshot.cities.get(city_idx)?;
        let district = city.districts.get(district_idx)?;
        Some((city.name.clone(), district.name.clone()))
    }

    pub async fn product_type(
        &self,
        city_idx: usize,
        district_idx: usize,
        type_idx: usize,
    ) -> Option<(String, String, String)> {
        let snapshot = self.snapshot.read().await;
        let city = snapshot.cities.get(city_idx)?;
        let district = city.districts.get(district_idx)?;
        let product_type = district.types.get(type_idx)?;
        Some((city.name.clone(), district.name.clone(), product_type.clone()))
    }
}
