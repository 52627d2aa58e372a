//! Printable badges: one PDF page per participant, zipped for batches.
//!
//! The page is the template image at its physical size. The participant name
//! and a QR code carrying the participant id are drawn on top at offsets
//! measured from the top-left corner.

use image::{DynamicImage, Rgb, RgbImage};
use printpdf::{BuiltinFont, Image, ImageTransform, Mm, PdfDocument};
use qrcode::{Color, QrCode};
use std::io::{Cursor, Write};
use std::path::Path;
use thiserror::Error;
use tracing::info;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::IdCardConfig;
use crate::participant::Participant;

const MM_PER_INCH: f32 = 25.4;
const DEFAULT_CARD_MM: (f32, f32) = (54.0, 86.0);
const QR_QUIET_ZONE: usize = 2;

#[derive(Debug, Error)]
pub enum IdCardError {
    #[error("badge template could not be read: {0}")]
    Template(#[from] image::ImageError),

    #[error("QR code could not be encoded: {0}")]
    Qr(#[from] qrcode::types::QrError),

    #[error("PDF generation failed: {0}")]
    Pdf(#[from] printpdf::Error),

    #[error("zip archive failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Physical size of an image printed at `dpi`, in millimetres
pub fn size_mm(width_px: u32, height_px: u32, dpi: f32) -> (f32, f32) {
    (
        width_px as f32 / dpi * MM_PER_INCH,
        height_px as f32 / dpi * MM_PER_INCH,
    )
}

/// File-name friendly version of a name: lowercase ASCII words joined by `-`
pub fn slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "participant".to_string()
    } else {
        slug.to_string()
    }
}

/// Archive entry name for a participant's badge
pub fn badge_file_name(participant: &Participant) -> String {
    let prefix: String = participant.id.chars().take(8).collect();
    format!("{}-{}.pdf", slug(&participant.name), prefix)
}

/// QR code as an RGB image, `scale` pixels per module
fn qr_image(data: &str, scale: u32) -> Result<RgbImage, IdCardError> {
    let code = QrCode::new(data.as_bytes())?;
    let modules = code.width();
    let colors = code.to_colors();
    let side = (modules + 2 * QR_QUIET_ZONE) as u32 * scale;

    Ok(RgbImage::from_fn(side, side, |x, y| {
        let (mx, my) = ((x / scale) as usize, (y / scale) as usize);
        let dark = mx >= QR_QUIET_ZONE
            && my >= QR_QUIET_ZONE
            && mx - QR_QUIET_ZONE < modules
            && my - QR_QUIET_ZONE < modules
            && colors[(my - QR_QUIET_ZONE) * modules + (mx - QR_QUIET_ZONE)] == Color::Dark;
        if dark { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
    }))
}

pub struct IdCardRenderer {
    template: Option<DynamicImage>,
    layout: IdCardConfig,
}

impl IdCardRenderer {
    pub fn new(template: Option<DynamicImage>, layout: IdCardConfig) -> Self {
        // printpdf embeds RGB data only
        let template = template.map(|image| DynamicImage::ImageRgb8(image.to_rgb8()));
        Self { template, layout }
    }

    /// Load the template named in the configuration, if any
    pub fn from_config(layout: &IdCardConfig) -> Result<Self, IdCardError> {
        let template = match &layout.template {
            Some(path) => Some(load_template(path)?),
            None => None,
        };
        Ok(Self::new(template, layout.clone()))
    }

    /// Page size in millimetres
    pub fn page_mm(&self) -> (f32, f32) {
        match &self.template {
            Some(image) => size_mm(image.width(), image.height(), self.layout.dpi),
            None => DEFAULT_CARD_MM,
        }
    }

    /// Render one badge as a PDF document
    pub fn render(&self, participant: &Participant) -> Result<Vec<u8>, IdCardError> {
        let layout = &self.layout;
        let (width, height) = self.page_mm();

        let (doc, page, layer) =
            PdfDocument::new(participant.name.as_str(), Mm(width), Mm(height), "Badge");
        let layer = doc.get_page(page).get_layer(layer);

        if let Some(template) = &self.template {
            Image::from_dynamic_image(template).add_to_layer(
                layer.clone(),
                ImageTransform {
                    translate_x: Some(Mm(0.0)),
                    translate_y: Some(Mm(0.0)),
                    dpi: Some(layout.dpi),
                    ..Default::default()
                },
            );
        }

        // PDF space grows upwards from the bottom-left corner
        let font = doc.add_builtin_font(BuiltinFont::HelveticaBold)?;
        layer.use_text(
            participant.name.as_str(),
            layout.font_pt,
            Mm(layout.name_x_mm),
            Mm(height - layout.name_y_mm),
            &font,
        );

        // Whole pixels per module keep the code sharp; scaling fixes the size
        let target_px = (layout.qr_mm / MM_PER_INCH * layout.dpi).max(1.0);
        let modules = QrCode::new(participant.id.as_bytes())?.width() + 2 * QR_QUIET_ZONE;
        let scale = ((target_px / modules as f32).floor() as u32).max(1);
        let qr = qr_image(&participant.id, scale)?;
        let (qr_mm, _) = size_mm(qr.width(), qr.height(), layout.dpi);
        let factor = layout.qr_mm / qr_mm;

        Image::from_dynamic_image(&DynamicImage::ImageRgb8(qr)).add_to_layer(
            layer,
            ImageTransform {
                translate_x: Some(Mm(layout.qr_x_mm)),
                translate_y: Some(Mm(height - layout.qr_y_mm - layout.qr_mm)),
                scale_x: Some(factor),
                scale_y: Some(factor),
                dpi: Some(layout.dpi),
                ..Default::default()
            },
        );

        Ok(doc.save_to_bytes()?)
    }

    /// Render every badge into a zip archive
    pub fn render_batch(&self, participants: &[Participant]) -> Result<Vec<u8>, IdCardError> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        for participant in participants {
            let pdf = self.render(participant)?;
            zip.start_file(badge_file_name(participant), options)?;
            zip.write_all(&pdf)?;
        }

        Ok(zip.finish()?.into_inner())
    }
}

fn load_template(path: &Path) -> Result<DynamicImage, IdCardError> {
    let image = image::open(path)?;
    info!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        "badge template loaded"
    );
    Ok(image)
}

pub use web::*;

mod web {
    use axum::{
        Json,
        body::Body,
        extract::{Path, State},
        http::{StatusCode, header},
        response::{IntoResponse, Response},
    };
    use serde::Deserialize;
    use std::sync::Arc;

    use super::*;
    use crate::app::AppState;
    use crate::error::AppError;
    use crate::participant::{self, ParticipantQuery};

    #[derive(Debug, Default, Deserialize)]
    pub struct BatchRequest {
        /// Participants to include; everyone when absent
        #[serde(default)]
        pub ids: Option<Vec<String>>,
    }

    fn attachment(content_type: &str, filename: &str, body: Vec<u8>) -> Result<Response, AppError> {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            )
            .body(Body::from(body))
            .map_err(|e| AppError::Internal(e.to_string()))
    }

    async fn render_blocking<T, F>(renderer: Arc<IdCardRenderer>, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&IdCardRenderer) -> Result<T, IdCardError> + Send + 'static,
    {
        let rendered = tokio::task::spawn_blocking(move || f(&renderer))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(rendered?)
    }

    pub async fn handle_idcard(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<impl IntoResponse, AppError> {
        let participant = participant::get_participant(&state.store, &id).await?;
        let filename = badge_file_name(&participant);
        let pdf = render_blocking(state.idcards.clone(), move |r| r.render(&participant)).await?;
        attachment("application/pdf", &filename, pdf)
    }

    pub async fn handle_idcard_batch(
        State(state): State<AppState>,
        Json(request): Json<BatchRequest>,
    ) -> Result<impl IntoResponse, AppError> {
        let participants = match request.ids {
            Some(ids) => {
                let mut selected = Vec::with_capacity(ids.len());
                for id in &ids {
                    selected.push(participant::get_participant(&state.store, id).await?);
                }
                selected
            }
            None => participant::list_participants(&state.store, &ParticipantQuery::default()).await?,
        };
        if participants.is_empty() {
            return Err(AppError::BadRequest("No participants selected".to_string()));
        }

        let count = participants.len();
        let archive =
            render_blocking(state.idcards.clone(), move |r| r.render_batch(&participants)).await?;
        info!(count, bytes = archive.len(), "badge archive generated");
        attachment("application/zip", "idcards.zip", archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::Checkpoint;
    use chrono::Utc;
    use std::io::Read;

    fn participant(id: &str, name: &str) -> Participant {
        let now = Utc::now();
        Participant {
            id: id.to_string(),
            name: name.to_string(),
            email: "ada@example.org".to_string(),
            phone: None,
            team: None,
            college: Checkpoint::default(),
            lab: Checkpoint::default(),
            wifi: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn slugs_are_file_name_safe() {
        assert_eq!(slug("Ada Lovelace"), "ada-lovelace");
        assert_eq!(slug("  Grace  M. Hopper!"), "grace-m-hopper");
        assert_eq!(slug("李雷"), "participant");
    }

    #[test]
    fn page_size_follows_template_dpi() {
        let (w, h) = size_mm(638, 1016, 300.0);
        assert!((w - 54.0).abs() < 0.1);
        assert!((h - 86.0).abs() < 0.1);

        let template = DynamicImage::new_rgb8(300, 600);
        let renderer = IdCardRenderer::new(Some(template), IdCardConfig::default());
        let (w, h) = renderer.page_mm();
        assert!((w - 25.4).abs() < 0.01);
        assert!((h - 50.8).abs() < 0.01);
    }

    #[test]
    fn qr_images_have_a_quiet_zone() {
        let image = qr_image("3f2b9c1e", 4).unwrap();
        assert_eq!(image.width(), image.height());
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 255, 255]));
        // Top-left finder pattern starts right after the quiet zone
        let edge = (QR_QUIET_ZONE as u32) * 4;
        assert_eq!(image.get_pixel(edge, edge), &Rgb([0, 0, 0]));
    }

    #[test]
    fn single_badge_is_a_pdf() {
        let renderer = IdCardRenderer::new(None, IdCardConfig::default());
        let pdf = renderer
            .render(&participant("3f2b9c1e-0000", "Ada Lovelace"))
            .unwrap();
        assert!(pdf.starts_with(b"%PDF"));
    }

    #[test]
    fn batches_hold_one_pdf_per_participant() {
        let renderer = IdCardRenderer::new(None, IdCardConfig::default());
        let archive = renderer
            .render_batch(&[
                participant("3f2b9c1e-aaaa", "Ada Lovelace"),
                participant("9d8c7b6a-bbbb", "Grace Hopper"),
            ])
            .unwrap();

        let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        assert_eq!(zip.len(), 2);

        let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["ada-lovelace-3f2b9c1e.pdf", "grace-hopper-9d8c7b6a.pdf"]);

        let mut pdf = Vec::new();
        zip.by_name("ada-lovelace-3f2b9c1e.pdf")
            .unwrap()
            .read_to_end(&mut pdf)
            .unwrap();
        assert!(pdf.starts_with(b"%PDF"));
    }
}
