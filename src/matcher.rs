//! Geographic driver matching.
//!
//! A driver sees an order when its origin lies inside their service radius
//! and the price clears their floor. Matching never touches the network:
//! order coordinates are resolved at extraction time and driver homes are
//! stored.

use anyhow::Result;
use tracing::debug;

use crate::geo;
use crate::parser::ParsedOrder;
use crate::store::{Driver, Store};

/// One driver cleared to receive an order.
#[derive(Debug, Clone)]
pub struct MatchedDriver {
    pub driver: Driver,
    pub distance_km: f64,
    /// True when the driver got the order through the admin sweep rather
    /// than a group subscription.
    pub admin_extra: bool,
}

/// Radius and price gate for one driver. `Some(distance)` means eligible.
///
/// An unpriced order passes every price floor; negotiation happens in chat.
pub fn driver_matches(driver: &Driver, order: &ParsedOrder) -> Option<f64> {
    let home = driver.coords()?;
    let origin = order.point_a_coords?;
    let distance = geo::distance_km(home, origin);
    if distance > driver.radius_km {
        return None;
    }
    if driver.min_price > 0 {
        if let Some(price) = order.price {
            if price < driver.min_price {
                return None;
            }
        }
    }
    Some(distance)
}

/// All drivers who should hear about `order`, nearest first, admins swept
/// in last.
///
/// With `filter_by_group` set, only subscribers of the source group are
/// considered; a group nobody subscribes to falls back to the whole active
/// roster so a fresh deployment still delivers. Admins bypass the group
/// filter but not the radius/price gate; the ones who got the order without
/// a subscription are flagged `admin_extra`.
pub fn find_matching_drivers(
    store: &Store,
    order: &ParsedOrder,
    filter_by_group: bool,
) -> Result<Vec<MatchedDriver>> {
    let active = store.active_drivers()?;

    let subscribed: Vec<Driver> = if filter_by_group {
        let subscriber_ids = store.drivers_subscribed_to_group(order.source_group_id)?;
        if subscriber_ids.is_empty() {
            debug!(
                "No subscribers for group {}; matching against full roster",
                order.source_group_id
            );
            active.clone()
        } else {
            active
                .iter()
                .filter(|d| subscriber_ids.contains(&d.telegram_id))
                .cloned()
                .collect()
        }
    } else {
        active.clone()
    };

    let mut matched: Vec<MatchedDriver> = subscribed
        .iter()
        .filter_map(|d| {
            driver_matches(d, order).map(|distance_km| MatchedDriver {
                driver: d.clone(),
                distance_km,
                admin_extra: false,
            })
        })
        .collect();
    matched.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));

    for admin in store.admins()? {
        if matched.iter().any(|m| m.driver.telegram_id == admin.telegram_id) {
            continue;
        }
        let Some(distance_km) = driver_matches(&admin, order) else {
            continue;
        };
        let subscribed = store.is_subscribed(admin.telegram_id, order.source_group_id)?;
        matched.push(MatchedDriver {
            driver: admin,
            distance_km,
            admin_extra: !subscribed,
        });
    }

    Ok(matched)
}
