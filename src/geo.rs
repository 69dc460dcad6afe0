//! Geospatial matching of capture coordinates to collection points.

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CollectionPoint, CreateCollectionPointRequest};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two WGS84 coordinates.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    2.0 * a.sqrt().asin() * EARTH_RADIUS_M
}

/// Nearest active point whose own radius contains the query, boundary
/// inclusive. Equidistant qualifying points tie-break on the smaller id so
/// the answer is stable.
pub fn nearest_containing(points: &[CollectionPoint], lat: f64, lng: f64) -> Option<&CollectionPoint> {
    points
        .iter()
        .filter(|point| point.active)
        .filter_map(|point| {
            let distance = haversine_m(lat, lng, point.latitude, point.longitude);
            (distance <= point.radius_m).then_some((distance, point))
        })
        .min_by(|(da, pa), (db, pb)| da.total_cmp(db).then_with(|| pa.id.cmp(&pb.id)))
        .map(|(_, point)| point)
}

/// Collection point registry and matcher
pub struct GeoService {
    pool: PgPool,
}

impl GeoService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find the nearest active collection point containing the coordinates.
    pub async fn find_nearest_active(&self, lat: f64, lng: f64) -> Result<Option<CollectionPoint>> {
        let points = self.list_active().await?;
        Ok(nearest_containing(&points, lat, lng).cloned())
    }

    pub async fn list_active(&self) -> Result<Vec<CollectionPoint>> {
        let points = sqlx::query_as::<_, CollectionPoint>(
            "SELECT * FROM collection_points WHERE active = TRUE ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(points)
    }

    /// Register a new collection point (operations staff only).
    pub async fn create_point(&self, request: CreateCollectionPointRequest) -> Result<CollectionPoint> {
        let point = sqlx::query_as::<_, CollectionPoint>(
            r#"
            INSERT INTO collection_points (id, name, latitude, longitude, radius_m, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.name)
        .bind(request.latitude)
        .bind(request.longitude)
        .bind(request.radius_m)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(point)
    }

    /// Toggle activation. Points are never deleted so submissions keep their
    /// referential history.
    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<Option<CollectionPoint>> {
        let point = sqlx::query_as::<_, CollectionPoint>(
            "UPDATE collection_points SET active = $2, updated_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(active)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn point(id: u128, lat: f64, lng: f64, radius_m: f64, active: bool) -> CollectionPoint {
        CollectionPoint {
            id: Uuid::from_u128(id),
            name: format!("point-{id}"),
            latitude: lat,
            longitude: lng,
            radius_m,
            active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn haversine_matches_known_distances() {
        // Identical coordinates.
        assert_eq!(haversine_m(48.85, 2.35, 48.85, 2.35), 0.0);

        // One degree of latitude is ~111.2 km on a 6371 km sphere.
        let one_degree = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((one_degree - 111_195.0).abs() < 100.0, "got {one_degree}");
    }

    #[test]
    fn radius_boundary_is_inclusive() {
        let center = (52.52, 13.405);
        let query = (52.521, 13.406);
        let distance = haversine_m(query.0, query.1, center.0, center.1);

        // Exactly on the boundary: included.
        let exact = vec![point(1, center.0, center.1, distance, true)];
        assert!(nearest_containing(&exact, query.0, query.1).is_some());

        // Just outside: excluded.
        let outside = vec![point(1, center.0, center.1, distance - 0.5, true)];
        assert!(nearest_containing(&outside, query.0, query.1).is_none());
    }

    #[test]
    fn nearest_qualifying_point_wins() {
        let points = vec![
            point(1, 10.0, 10.0, 500.0, true),
            // ~150m closer to the query.
            point(2, 10.0005, 10.0, 500.0, true),
        ];
        let found = nearest_containing(&points, 10.001, 10.0).unwrap();
        assert_eq!(found.id, Uuid::from_u128(2));
    }

    #[test]
    fn equidistant_tie_breaks_on_smaller_id() {
        let points = vec![
            point(7, 10.0, 10.0, 200.0, true),
            point(3, 10.0, 10.0, 200.0, true),
        ];
        let found = nearest_containing(&points, 10.0001, 10.0).unwrap();
        assert_eq!(found.id, Uuid::from_u128(3));
    }

    #[test]
    fn inactive_points_are_ignored() {
        let points = vec![point(1, 10.0, 10.0, 1_000.0, false)];
        assert!(nearest_containing(&points, 10.0, 10.0).is_none());
    }
}
