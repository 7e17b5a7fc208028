use std::collections::HashMap;

/// One row of the zip reference table. Population is coerced on load;
/// unparseable values become zero rather than failing the scan.
#[derive(Debug, Clone)]
pub struct ZipRecord {
    pub zip: String,
    pub latitude: f64,
    pub longitude: f64,
    pub population: u64,
}

/// A deduplicated search location. Multiple zip records sharing the exact
/// same coordinate pair collapse into one cell, summing population and
/// collecting contributing zips in scan order.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCell {
    pub latitude: f64,
    pub longitude: f64,
    pub population: u64,
    pub zips: Vec<String>,
}

/// Geographic box spanned around a cell, expressed as degree bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

const MILES_PER_DEGREE: f64 = 69.0;

impl BoundingBox {
    pub fn around(latitude: f64, longitude: f64, radius_miles: f64) -> Self {
        let lat_radius = radius_miles / MILES_PER_DEGREE;
        let lon_radius = radius_miles / (MILES_PER_DEGREE * latitude.to_radians().cos());
        Self {
            south: latitude - lat_radius,
            north: latitude + lat_radius,
            west: longitude - lon_radius,
            east: longitude + lon_radius,
        }
    }
}

/// Collapses zip records into search cells keyed on exact coordinate
/// equality (bit-for-bit, no rounding). Emission order is first-encounter
/// order, which is deterministic because the source scan is zip-ordered.
pub fn dedupe_cells(records: impl IntoIterator<Item = ZipRecord>) -> Vec<SearchCell> {
    let mut index: HashMap<(u64, u64), usize> = HashMap::new();
    let mut cells: Vec<SearchCell> = Vec::new();

    for record in records {
        let key = (record.latitude.to_bits(), record.longitude.to_bits());
        match index.get(&key) {
            Some(&at) => {
                let cell = &mut cells[at];
                cell.population += record.population;
                cell.zips.push(record.zip);
            }
            None => {
                index.insert(key, cells.len());
                cells.push(SearchCell {
                    latitude: record.latitude,
                    longitude: record.longitude,
                    population: record.population,
                    zips: vec![record.zip],
                });
            }
        }
    }

    cells
}

/// Derives the search radius in miles from an aggregated population: the
/// population is spread over an area at a fixed density, the square area's
/// half side length becomes the radius, floored so sparse cells still get a
/// usable search box.
pub fn search_radius_miles(population: u64, density: f64, min_radius_miles: f64) -> f64 {
    let area_sq_miles = population as f64 / density;
    let side_length_miles = area_sq_miles.sqrt();
    (side_length_miles / 2.0).max(min_radius_miles)
}

impl SearchCell {
    pub fn bounding_box(&self, density: f64, min_radius_miles: f64) -> BoundingBox {
        let radius = search_radius_miles(self.population, density, min_radius_miles);
        BoundingBox::around(self.latitude, self.longitude, radius)
    }

    /// Cell label for log context, e.g. `40.75,-73.99 (10001, 10002)`.
    pub fn describe(&self) -> String {
        format!(
            "{},{} ({})",
            self.latitude,
            self.longitude,
            self.zips.join(", ")
        )
    }
}
