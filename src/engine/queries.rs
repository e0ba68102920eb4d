use ulid::Ulid;

use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// All resources, sorted by name.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
                reservation_count: guard.reservations.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn resource_exists(&self, id: &Ulid) -> bool {
        self.state.contains_key(id)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let resource_id = self
            .resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// One page of reservations sorted by start time, optionally filtered to
    /// a single resource. An unknown resource yields an empty page.
    pub async fn list_reservations(&self, query: &ReservationQuery) -> ReservationPage {
        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);

        let resources: Vec<_> = match query.resource_id {
            Some(id) => self.get_resource(&id).into_iter().collect(),
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };
        let mut all = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            all.extend(guard.reservations.iter().cloned());
        }
        all.sort_by_key(|r| (r.span.start, r.id));

        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        ReservationPage {
            items,
            page,
            page_size,
            total,
            pages: total.div_ceil(page_size),
        }
    }
}
