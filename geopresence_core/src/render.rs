//! Render consumer contract.
//!
//! A renderer receives the full `(state, snapshot)` on every notification and
//! redraws from scratch. Nothing here keeps per-marker state between frames.

use crate::bridge::PresenceView;
use crate::snapshot::PresenceSnapshot;

use geo::{coord, BoundingRect, MultiPoint, Point, Rect};
use h3o::{CellIndex, LatLng, Resolution};
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Padding applied around markers when fitting the map view.
pub const DEFAULT_BOUNDS_PADDING: f64 = 0.2;

/// Shown instead of markers when the snapshot is empty.
pub const EMPTY_PLACEHOLDER: &str = "No active locations. Send a location to see it on the map!";

/// Something that draws a presence view.
pub trait MapRenderer {
    /// Redraws everything from `view`. Must accept an empty snapshot.
    fn render(&mut self, view: &PresenceView);
}

/// Renders the current view, then again on every change until the
/// publisher goes away. Returns the number of renders.
///
/// With `min_interval` set, changes arriving faster than that are coalesced
/// into the next render.
pub async fn drive_renderer<R: MapRenderer + ?Sized>(
    mut views: watch::Receiver<PresenceView>,
    renderer: &mut R,
    min_interval: Option<Duration>,
) -> usize {
    let mut renders = 0;
    loop {
        let view = views.borrow_and_update().clone();
        renderer.render(&view);
        renders += 1;

        if let Some(interval) = min_interval {
            tokio::time::sleep(interval).await;
        }
        if views.changed().await.is_err() {
            return renders;
        }
    }
}

/// Bounding rectangle of all markers (x = longitude, y = latitude), grown by
/// `padding` times its extent on every side. `None` when there are no markers.
pub fn fit_bounds(snapshot: &PresenceSnapshot, padding: f64) -> Option<Rect<f64>> {
    let points: MultiPoint<f64> = snapshot
        .iter()
        .map(|entry| Point::new(entry.longitude(), entry.latitude()))
        .collect();
    let rect = points.bounding_rect()?;

    let pad_x = rect.width() * padding;
    let pad_y = rect.height() * padding;
    Some(Rect::new(
        coord! {
            x: (rect.min().x - pad_x).max(-180.0),
            y: (rect.min().y - pad_y).max(-90.0),
        },
        coord! {
            x: (rect.max().x + pad_x).min(180.0),
            y: (rect.max().y + pad_y).min(90.0),
        },
    ))
}

/// Markers that share an H3 cell.
#[derive(Debug, Clone)]
pub struct MarkerCluster {
    pub cell: CellIndex,
    pub center: LatLng,
    /// Member identities in snapshot order
    pub identities: Vec<String>,
}

impl MarkerCluster {
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Groups markers by H3 cell, ordered by each cluster's first member.
pub fn cluster_markers(snapshot: &PresenceSnapshot, resolution: Resolution) -> Vec<MarkerCluster> {
    let mut clusters: Vec<MarkerCluster> = Vec::new();
    let mut by_cell: HashMap<CellIndex, usize> = HashMap::new();

    for entry in snapshot {
        let position = match LatLng::new(entry.latitude(), entry.longitude()) {
            Ok(position) => position,
            Err(e) => {
                warn!(identity = entry.identity(), error = ?e, "skipping marker");
                continue;
            }
        };
        let cell = position.to_cell(resolution);

        match by_cell.get(&cell) {
            Some(&index) => clusters[index].identities.push(entry.identity().to_string()),
            None => {
                by_cell.insert(cell, clusters.len());
                clusters.push(MarkerCluster {
                    cell,
                    center: LatLng::from(cell),
                    identities: vec![entry.identity().to_string()],
                });
            }
        }
    }

    clusters
}

/// H3 resolution that keeps clusters roughly marker-sized at a web-map zoom.
pub fn resolution_for_zoom(zoom: u8) -> Resolution {
    Resolution::try_from(zoom.saturating_sub(3).min(15)).unwrap_or(Resolution::Zero)
}

/// Plain-text renderer (terminal).
pub struct TextRenderer<W: Write> {
    out: W,
}

impl<W: Write> TextRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_view(&mut self, view: &PresenceView) -> io::Result<()> {
        writeln!(self.out, "[{}]", view.state.badge())?;

        if view.snapshot.is_empty() {
            writeln!(self.out, "{EMPTY_PLACEHOLDER}")?;
        } else {
            writeln!(self.out, "{} active location(s)", view.snapshot.len())?;
            for entry in &view.snapshot {
                writeln!(
                    self.out,
                    "  {:<16} {:>11.6} {:>11.6}  {}",
                    entry.identity(),
                    entry.latitude(),
                    entry.longitude(),
                    entry.observed_at().format("%H:%M:%S"),
                )?;
            }
        }
        self.out.flush()
    }
}

impl<W: Write> MapRenderer for TextRenderer<W> {
    fn render(&mut self, view: &PresenceView) {
        if let Err(e) = self.write_view(view) {
            warn!(error = %e, "render failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PositionUpdate;
    use crate::state::ConnectionState;
    use approx::assert_relative_eq;
    use chrono::DateTime;

    fn snapshot(points: &[(&str, f64, f64)]) -> PresenceSnapshot {
        let observed_at = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
        points.iter().fold(PresenceSnapshot::empty(), |snapshot, (id, lat, lon)| {
            snapshot.merged(PositionUpdate::new(*id, *lat, *lon, observed_at).unwrap())
        })
    }

    #[test]
    fn test_fit_bounds_pads_extent() {
        let snap = snapshot(&[("alice", 40.0, -74.0), ("bob", 50.0, -64.0)]);
        let rect = fit_bounds(&snap, DEFAULT_BOUNDS_PADDING).unwrap();

        assert_relative_eq!(rect.min().x, -76.0, epsilon = 1e-9);
        assert_relative_eq!(rect.max().x, -62.0, epsilon = 1e-9);
        assert_relative_eq!(rect.min().y, 38.0, epsilon = 1e-9);
        assert_relative_eq!(rect.max().y, 52.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fit_bounds_edge_cases() {
        assert!(fit_bounds(&PresenceSnapshot::empty(), DEFAULT_BOUNDS_PADDING).is_none());

        let single = fit_bounds(&snapshot(&[("alice", 10.0, 20.0)]), DEFAULT_BOUNDS_PADDING).unwrap();
        assert_relative_eq!(single.min().x, 20.0);
        assert_relative_eq!(single.max().y, 10.0);

        let wide = fit_bounds(&snapshot(&[("a", -80.0, -170.0), ("b", 80.0, 170.0)]), 0.5).unwrap();
        assert_relative_eq!(wide.min().x, -180.0);
        assert_relative_eq!(wide.max().y, 90.0);
    }

    #[test]
    fn test_cluster_markers_groups_by_cell() {
        let snap = snapshot(&[
            ("alice", 40.7128, -74.0060),
            ("bob", 51.5074, -0.1278),
            ("carol", 40.7129, -74.0061),
        ]);

        let clusters = cluster_markers(&snap, Resolution::Five);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].identities, vec!["alice", "carol"]);
        assert_eq!(clusters[1].identities, vec!["bob"]);
        assert_relative_eq!(clusters[1].center.lat(), 51.5, epsilon = 0.5);

        let fine = cluster_markers(&snap, Resolution::Fifteen);
        assert_eq!(fine.len(), 3);
    }

    #[test]
    fn test_resolution_for_zoom() {
        assert_eq!(resolution_for_zoom(0), Resolution::Zero);
        assert_eq!(resolution_for_zoom(13), Resolution::Ten);
        assert_eq!(resolution_for_zoom(22), Resolution::Fifteen);
    }

    #[test]
    fn test_text_renderer() {
        let mut renderer = TextRenderer::new(Vec::new());
        renderer.render(&PresenceView::default());
        renderer.render(&PresenceView {
            state: ConnectionState::Connected,
            snapshot: snapshot(&[("alice", 40.71, -74.0)]),
        });

        let text = String::from_utf8(renderer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[Idle]");
        assert_eq!(lines[1], EMPTY_PLACEHOLDER);
        assert_eq!(lines[2], "[Connected]");
        assert_eq!(lines[3], "1 active location(s)");
        assert!(lines[4].contains("alice"));
        assert!(lines[4].contains("40.710000"));
        assert!(lines[4].contains("-74.000000"));
    }

    #[derive(Default)]
    struct Recording {
        states: Vec<ConnectionState>,
    }

    impl MapRenderer for Recording {
        fn render(&mut self, view: &PresenceView) {
            self.states.push(view.state);
        }
    }

    #[tokio::test]
    async fn test_drive_renderer_stops_when_publisher_drops() {
        let (tx, rx) = watch::channel(PresenceView::default());
        let task = tokio::spawn(async move {
            let mut renderer = Recording::default();
            let renders = drive_renderer(rx, &mut renderer, None).await;
            (renders, renderer)
        });

        tx.send_modify(|view| view.state = ConnectionState::Connected);
        drop(tx);

        let (renders, renderer) = task.await.unwrap();
        assert!(renders >= 1);
        assert_eq!(renderer.states.len(), renders);
        assert_eq!(renderer.states.last(), Some(&ConnectionState::Connected));
    }
}
