use crate::client::{ChunkResponse, WorkerClient};
use crate::config::WorkerConfig;
use crate::error::{ErrorCode, ErrorPayload, WorkerError};
use crate::model::{SheetSummary, SpilloverRange, Viewport, WorkbookRef};
use crate::spillover::SpilloverConfig;
use crate::viewport::{CellState, PlanId, PlannedRequest, ViewportManager, ViewportSettings};
use ahash::AHashMap;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type InFlight = BoxFuture<'static, (PlanId, Result<ChunkResponse, WorkerError>)>;

/// Drives a [`ViewportManager`] for one open workbook over a [`WorkerClient`]
pub struct ViewerSession {
    client: WorkerClient,
    workbook: WorkbookRef,
    sheets: Vec<SheetSummary>,
    manager: ViewportManager,
    settings: ViewportSettings,
    spillover: SpilloverConfig,
    extract_styles: bool,
    in_flight: FuturesUnordered<InFlight>,
    tokens: AHashMap<PlanId, CancellationToken>,
}

impl ViewerSession {
    /// Load the structure and request the first sheet's default viewport.
    /// A workbook without sheets is a load failure.
    pub async fn open(
        client: WorkerClient,
        workbook: WorkbookRef,
        config: &WorkerConfig,
        extract_styles: bool,
    ) -> Result<Self, WorkerError> {
        let structure = client.load_structure(&workbook).await?;
        let sheets = structure.structure;
        let Some(first) = sheets.first().cloned() else {
            return Err(WorkerError::Remote(ErrorPayload::new(
                ErrorCode::LoadFailed,
                format!("workbook {} has no sheets", workbook.key),
            )));
        };

        let settings = ViewportSettings {
            tile_rows: config.tile_rows,
            tile_cols: config.tile_cols,
            retention_margin: config.retention_margin,
        };
        let mut session = Self {
            client,
            workbook,
            manager: ViewportManager::new(&first, settings),
            sheets,
            settings,
            spillover: config.spillover,
            extract_styles,
            in_flight: FuturesUnordered::new(),
            tokens: AHashMap::new(),
        };
        session.set_viewport(first.default_viewport);
        Ok(session)
    }

    pub fn sheets(&self) -> &[SheetSummary] {
        &self.sheets
    }

    pub fn manager(&self) -> &ViewportManager {
        &self.manager
    }

    pub fn cell_state(&self, row: u32, col: u32) -> CellState<'_> {
        self.manager.cell_state(row, col)
    }

    pub fn spillovers(&self) -> Vec<SpilloverRange> {
        self.manager.spillovers_for_viewport(&self.spillover)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Move the viewport: issue requests for new tiles, cancel dropped ones
    pub fn set_viewport(&mut self, viewport: Viewport) {
        let planned = self.manager.set_viewport(viewport);
        for id in self.manager.take_stale() {
            if let Some(token) = self.tokens.remove(&id) {
                token.cancel();
            }
        }
        self.issue(planned);
    }

    /// Switch to another sheet, abandoning everything in flight
    pub fn switch_sheet(&mut self, index: usize) -> Option<&SheetSummary> {
        let sheet = self.sheets.get(index)?.clone();
        for (_, token) in self.tokens.drain() {
            token.cancel();
        }
        self.manager = ViewportManager::new(&sheet, self.settings);
        self.set_viewport(sheet.default_viewport);
        self.sheets.get(index)
    }

    /// Wait for every outstanding request, including follow-ups and retries
    pub async fn settle(&mut self) {
        while let Some((id, result)) = self.in_flight.next().await {
            self.tokens.remove(&id);
            let follow_up = match result {
                Ok(response) => self.manager.apply_chunk(id, response.chunk),
                Err(WorkerError::Cancelled) => {
                    debug!(plan = id, "chunk request cancelled");
                    Vec::new()
                }
                Err(err) => {
                    warn!(plan = id, error = %err, "chunk request failed");
                    self.manager.apply_failure(id)
                }
            };
            self.issue(follow_up);
        }
    }

    fn issue(&mut self, planned: Vec<PlannedRequest>) {
        for PlannedRequest { id, region } in planned {
            let token = CancellationToken::new();
            self.tokens.insert(id, token.clone());

            let client = self.client.clone();
            let workbook = self.workbook.clone();
            let extract_styles = self.extract_styles;
            self.in_flight.push(Box::pin(async move {
                let result = client
                    .process_chunk(&workbook, region, extract_styles, token)
                    .await;
                (id, result)
            }));
        }
    }
}
