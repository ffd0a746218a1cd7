// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/output/pdf_report.rs - PDF 筛查报告
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use image::RgbImage;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, Stream, StringFormat, dictionary};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::FundusFrame,
  model::{ClassificationResult, Finding, ModelLoadError, ModelManifest},
  output::{
    Render,
    report::{Block, IMAGE_LOAD_FAILED, Report, ReportContext},
  },
  path_from_url,
};

#[derive(Error, Debug)]
pub enum ReportError {
  #[error("PDF 错误: {0}")]
  Pdf(#[from] lopdf::Error),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型清单错误: {0}")]
  Manifest(#[from] ModelLoadError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

const PAGE_WIDTH: f32 = 595.28;
const PAGE_HEIGHT: f32 = 841.89;
const MARGIN: f32 = 50.0;
const CONTENT_WIDTH: f32 = PAGE_WIDTH - 2.0 * MARGIN;
/// 报告中眼底图的边长（3.5 英寸）
const IMAGE_SIZE: f32 = 252.0;
/// 嵌入 PDF 前把原图缩小到该边长以内
const IMAGE_MAX_PIXELS: u32 = 768;

#[derive(Debug, Clone, Copy)]
struct Rgb(f32, f32, f32);

impl Rgb {
  const fn hex(value: u32) -> Self {
    Rgb(
      ((value >> 16) & 0xff) as f32 / 255.0,
      ((value >> 8) & 0xff) as f32 / 255.0,
      (value & 0xff) as f32 / 255.0,
    )
  }

  fn operands(self) -> Vec<Object> {
    vec![self.0.into(), self.1.into(), self.2.into()]
  }
}

const GREEN: Rgb = Rgb::hex(0x0b5e3a);
const GREEN_TINT: Rgb = Rgb::hex(0xe8f5e9);
const BANNER_TINT: Rgb = Rgb::hex(0xf0f8f5);
const RED: Rgb = Rgb::hex(0xd32f2f);
const RED_TINT: Rgb = Rgb::hex(0xffebee);
const NOTICE_TINT: Rgb = Rgb::hex(0xfff3cd);
const KEY_TINT: Rgb = Rgb::hex(0xf5f5f5);
const BODY: Rgb = Rgb::hex(0x333333);
const MUTED: Rgb = Rgb::hex(0x666666);
const FAINT: Rgb = Rgb::hex(0x888888);
const GRID: Rgb = Rgb::hex(0xcccccc);
const WHITE: Rgb = Rgb::hex(0xffffff);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Font {
  Regular,
  Bold,
  Italic,
}

impl Font {
  fn resource(self) -> &'static str {
    match self {
      Font::Regular => "F1",
      Font::Bold => "F2",
      Font::Italic => "F3",
    }
  }
}

/// Helvetica 的 ASCII 字宽（千分之一 em），来自标准 AFM
const HELVETICA_WIDTHS: [u16; 95] = [
  278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, 556, 556, 556,
  556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, 1015, 667, 667, 722, 722, 667,
  611, 778, 722, 278, 500, 667, 556, 833, 722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667,
  667, 611, 278, 278, 278, 469, 556, 333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500,
  222, 833, 556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584,
];

fn text_width(text: &str, font: Font, size: f32) -> f32 {
  let units: u32 = text
    .chars()
    .map(|c| match c as u32 {
      code @ 32..=126 => HELVETICA_WIDTHS[(code - 32) as usize] as u32,
      _ => 556,
    })
    .sum();
  let scale = if font == Font::Bold { 1.05 } else { 1.0 };
  units as f32 * size / 1000.0 * scale
}

/// 转为 WinAnsiEncoding，无法表示的字符替换为 '?'
fn win_ansi(text: &str) -> Vec<u8> {
  text
    .chars()
    .map(|c| match c {
      ' '..='~' => c as u8,
      '\u{2022}' => 0x95,
      '\u{2013}' => 0x96,
      '\u{2014}' => 0x97,
      '\u{2018}' => 0x91,
      '\u{2019}' => 0x92,
      '\u{201c}' => 0x93,
      '\u{201d}' => 0x94,
      '\u{a0}'..='\u{ff}' => c as u32 as u8,
      _ => b'?',
    })
    .collect()
}

/// 比一行还宽的单词按字符硬断开，每段至少一个字符
fn split_long_word(word: &str, font: Font, size: f32, max_width: f32) -> Vec<String> {
  let mut pieces = Vec::new();
  let mut piece = String::new();
  for c in word.chars() {
    piece.push(c);
    if piece.chars().count() > 1 && text_width(&piece, font, size) > max_width {
      piece.pop();
      pieces.push(std::mem::replace(&mut piece, c.to_string()));
    }
  }
  if !piece.is_empty() {
    pieces.push(piece);
  }
  pieces
}

fn wrap(text: &str, font: Font, size: f32, max_width: f32) -> Vec<String> {
  let mut lines = Vec::new();
  let mut line = String::new();
  let words = text.split_whitespace().flat_map(|word| {
    if text_width(word, font, size) > max_width {
      split_long_word(word, font, size, max_width)
    } else {
      vec![word.to_string()]
    }
  });
  for word in words {
    let candidate = if line.is_empty() {
      word.to_string()
    } else {
      format!("{} {}", line, word)
    };
    if !line.is_empty() && text_width(&candidate, font, size) > max_width {
      lines.push(std::mem::replace(&mut line, word));
    } else {
      line = candidate;
    }
  }
  if !line.is_empty() {
    lines.push(line);
  }
  lines
}

#[derive(Debug, Clone, Copy)]
enum Align {
  Left,
  Center,
}

/// 逐页收集绘制指令，放不下时换页
struct Layout {
  pages: Vec<Vec<Operation>>,
  ops: Vec<Operation>,
  y: f32,
  images: Vec<RgbImage>,
}

impl Layout {
  fn new() -> Self {
    Self {
      pages: Vec::new(),
      ops: Vec::new(),
      y: PAGE_HEIGHT - MARGIN,
      images: Vec::new(),
    }
  }

  fn new_page(&mut self) {
    let ops = std::mem::take(&mut self.ops);
    self.pages.push(ops);
    self.y = PAGE_HEIGHT - MARGIN;
  }

  fn ensure(&mut self, height: f32) {
    if self.y - height < MARGIN && !self.ops.is_empty() {
      self.new_page();
    }
  }

  fn skip(&mut self, height: f32) {
    self.y = (self.y - height).max(MARGIN);
  }

  fn finish(mut self) -> (Vec<Vec<Operation>>, Vec<RgbImage>) {
    if !self.ops.is_empty() || self.pages.is_empty() {
      self.new_page();
    }
    (self.pages, self.images)
  }

  fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Rgb) {
    self.ops.push(Operation::new("rg", color.operands()));
    self
      .ops
      .push(Operation::new("re", vec![x.into(), y.into(), w.into(), h.into()]));
    self.ops.push(Operation::new("f", vec![]));
  }

  fn stroke_rect(&mut self, x: f32, y: f32, w: f32, h: f32, width: f32, color: Rgb) {
    self.ops.push(Operation::new("w", vec![width.into()]));
    self.ops.push(Operation::new("RG", color.operands()));
    self
      .ops
      .push(Operation::new("re", vec![x.into(), y.into(), w.into(), h.into()]));
    self.ops.push(Operation::new("S", vec![]));
  }

  fn line(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, width: f32, color: Rgb) {
    self.ops.push(Operation::new("w", vec![width.into()]));
    self.ops.push(Operation::new("RG", color.operands()));
    self.ops.push(Operation::new("m", vec![x1.into(), y1.into()]));
    self.ops.push(Operation::new("l", vec![x2.into(), y2.into()]));
    self.ops.push(Operation::new("S", vec![]));
  }

  #[allow(clippy::too_many_arguments)]
  fn text(
    &mut self,
    text: &str,
    font: Font,
    size: f32,
    color: Rgb,
    x: f32,
    baseline: f32,
    width: f32,
    align: Align,
  ) {
    let x = match align {
      Align::Left => x,
      Align::Center => x + (width - text_width(text, font, size)).max(0.0) / 2.0,
    };
    self.ops.push(Operation::new("BT", vec![]));
    self
      .ops
      .push(Operation::new("Tf", vec![font.resource().into(), size.into()]));
    self.ops.push(Operation::new("rg", color.operands()));
    self
      .ops
      .push(Operation::new("Td", vec![x.into(), baseline.into()]));
    self.ops.push(Operation::new(
      "Tj",
      vec![Object::String(win_ansi(text), StringFormat::Literal)],
    ));
    self.ops.push(Operation::new("ET", vec![]));
  }

  /// 单行居中文本，可带底色和边框
  #[allow(clippy::too_many_arguments)]
  fn boxed_line(
    &mut self,
    text: &str,
    font: Font,
    size: f32,
    color: Rgb,
    padding: f32,
    fill: Option<Rgb>,
    border: Option<(f32, Rgb)>,
    align: Align,
  ) {
    let height = size + 2.0 * padding;
    self.ensure(height);
    let bottom = self.y - height;
    if let Some(fill) = fill {
      self.fill_rect(MARGIN, bottom, CONTENT_WIDTH, height, fill);
    }
    if let Some((width, border)) = border {
      self.stroke_rect(MARGIN, bottom, CONTENT_WIDTH, height, width, border);
    }
    let baseline = bottom + padding + size * 0.22;
    self.text(
      text,
      font,
      size,
      color,
      MARGIN + padding,
      baseline,
      CONTENT_WIDTH - 2.0 * padding,
      align,
    );
    self.y = bottom;
  }

  fn paragraph(&mut self, text: &str, font: Font, size: f32, leading: f32, color: Rgb) {
    for line in wrap(text, font, size, CONTENT_WIDTH) {
      self.ensure(leading);
      let baseline = self.y - size;
      self.text(
        &line,
        font,
        size,
        color,
        MARGIN,
        baseline,
        CONTENT_WIDTH,
        Align::Left,
      );
      self.y -= leading;
    }
  }

  /// 通用表格：每格自动换行，行高取本行最高的单元格；
  /// 超过一页的行拆到后续页继续绘制
  fn table(
    &mut self,
    header: Option<&[String]>,
    rows: &[Vec<String>],
    widths: &[f32],
    key_column: bool,
    grid: Rgb,
  ) {
    const SIZE: f32 = 10.0;
    const LEADING: f32 = 13.0;
    const PAD: f32 = 6.0;

    let all_rows = header
      .into_iter()
      .map(|row| (row, true))
      .chain(rows.iter().map(|row| (row.as_slice(), false)));

    for (row, is_header) in all_rows {
      let cells: Vec<(Font, Vec<String>)> = row
        .iter()
        .zip(widths.iter())
        .enumerate()
        .map(|(col, (cell, width))| {
          let font = if is_header || (key_column && col == 0) {
            Font::Bold
          } else {
            Font::Regular
          };
          (font, wrap(cell, font, SIZE, width - 2.0 * PAD))
        })
        .collect();
      let lines = cells.iter().map(|(_, l)| l.len()).max().unwrap_or(1).max(1);

      let mut start = 0;
      while start < lines {
        let remaining = lines - start;
        self.ensure(remaining as f32 * LEADING + 2.0 * PAD);
        let fit = (((self.y - MARGIN - 2.0 * PAD) / LEADING).floor() as usize).max(1);
        let count = remaining.min(fit);
        let height = count as f32 * LEADING + 2.0 * PAD;
        let bottom = self.y - height;

        let mut x = MARGIN;
        for (col, ((font, cell_lines), width)) in cells.iter().zip(widths.iter()).enumerate() {
          let fill = if is_header {
            Some(GREEN)
          } else if key_column && col == 0 {
            Some(KEY_TINT)
          } else {
            None
          };
          if let Some(fill) = fill {
            self.fill_rect(x, bottom, *width, height, fill);
          }
          self.stroke_rect(x, bottom, *width, height, 0.5, grid);
          let color = if is_header { WHITE } else { BODY };
          let visible = cell_lines.iter().skip(start).take(count);
          for (i, line) in visible.enumerate() {
            let baseline = self.y - PAD - SIZE - i as f32 * LEADING + 1.0;
            self.text(
              line,
              *font,
              SIZE,
              color,
              x + PAD,
              baseline,
              width - 2.0 * PAD,
              Align::Left,
            );
          }
          x += width;
        }
        self.y = bottom;
        start += count;
      }
    }
  }

  fn image(&mut self, path: &Path) {
    let image = image::ImageReader::open(path)
      .and_then(|reader| reader.with_guessed_format())
      .map_err(image::ImageError::IoError)
      .and_then(|reader| reader.decode());

    let image = match image {
      Ok(image) if image.width().max(image.height()) > IMAGE_MAX_PIXELS => image
        .thumbnail(IMAGE_MAX_PIXELS, IMAGE_MAX_PIXELS)
        .to_rgb8(),
      Ok(image) => image.to_rgb8(),
      Err(e) => {
        warn!("报告中的眼底图加载失败: {}, 错误: {}", path.display(), e);
        self.paragraph(IMAGE_LOAD_FAILED, Font::Italic, 10.0, 16.0, BODY);
        return;
      }
    };

    let frame_width = 360.0;
    let height = IMAGE_SIZE + 24.0;
    self.ensure(height);
    let bottom = self.y - height;
    let frame_x = MARGIN + (CONTENT_WIDTH - frame_width) / 2.0;
    self.stroke_rect(frame_x, bottom, frame_width, height, 2.0, GREEN);

    let name = format!("Im{}", self.images.len() + 1);
    self.images.push(image);
    let x = MARGIN + (CONTENT_WIDTH - IMAGE_SIZE) / 2.0;
    self.ops.push(Operation::new("q", vec![]));
    self.ops.push(Operation::new(
      "cm",
      vec![
        IMAGE_SIZE.into(),
        0.into(),
        0.into(),
        IMAGE_SIZE.into(),
        x.into(),
        (bottom + 12.0).into(),
      ],
    ));
    self
      .ops
      .push(Operation::new("Do", vec![Object::Name(name.into_bytes())]));
    self.ops.push(Operation::new("Q", vec![]));
    self.y = bottom;
  }

  fn block(&mut self, block: &Block) {
    match block {
      Block::Title(text) => {
        self.boxed_line(text, Font::Bold, 24.0, GREEN, 3.0, None, None, Align::Center);
        self.skip(6.0);
      }
      Block::Subtitle(text) => {
        self.boxed_line(text, Font::Regular, 9.0, MUTED, 2.0, None, None, Align::Center);
        self.skip(20.0);
      }
      Block::Rule(width) => {
        self.ensure(width + 2.0);
        let y = self.y - width / 2.0;
        self.line(MARGIN, y, MARGIN + CONTENT_WIDTH, y, *width, GREEN);
        self.skip(width + 2.0);
      }
      Block::Banner(text) => {
        self.boxed_line(
          text,
          Font::Bold,
          18.0,
          GREEN,
          10.0,
          Some(BANNER_TINT),
          Some((2.0, GREEN)),
          Align::Center,
        );
        self.skip(30.0);
      }
      Block::Heading(text) => {
        // 标题不单独留在页尾
        self.ensure(16.0 + 25.0 + 12.0 + 30.0);
        self.skip(16.0);
        self.boxed_line(
          text,
          Font::Bold,
          13.0,
          GREEN,
          6.0,
          Some(GREEN_TINT),
          None,
          Align::Left,
        );
        self.skip(12.0);
      }
      Block::Paragraph(text) => self.paragraph(text, Font::Regular, 10.0, 16.0, BODY),
      Block::Bullet { lead, text } => {
        self.ensure(16.0);
        let baseline = self.y - 10.0;
        let bullet = format!("\u{2022} {}", lead);
        self.text(
          &bullet,
          Font::Bold,
          10.0,
          BODY,
          MARGIN,
          baseline,
          CONTENT_WIDTH,
          Align::Left,
        );
        let offset = text_width(&bullet, Font::Bold, 10.0) + 4.0;
        self.text(
          text,
          Font::Regular,
          10.0,
          BODY,
          MARGIN + offset,
          baseline,
          CONTENT_WIDTH - offset,
          Align::Left,
        );
        self.y -= 16.0;
      }
      Block::Verdict { text, finding } => {
        let (color, tint) = match finding {
          Finding::Positive => (RED, RED_TINT),
          Finding::Negative => (GREEN, GREEN_TINT),
        };
        self.boxed_line(
          text,
          Font::Bold,
          12.0,
          color,
          10.0,
          Some(tint),
          Some((1.0, color)),
          Align::Center,
        );
        self.skip(10.0);
      }
      Block::KeyValue(rows) => {
        let rows: Vec<Vec<String>> = rows
          .iter()
          .map(|(k, v)| vec![k.clone(), v.clone()])
          .collect();
        self.table(None, &rows, &[150.0, CONTENT_WIDTH - 150.0], true, GRID);
      }
      Block::Table {
        header,
        rows,
        widths,
      } => self.table(Some(header.as_slice()), rows, widths, false, GREEN),
      Block::Notice { lead, text } => {
        const PAD: f32 = 15.0;
        let lines = wrap(text, Font::Regular, 10.0, CONTENT_WIDTH - 2.0 * PAD);
        let height = 2.0 * PAD + 16.0 * (lines.len() as f32 + 2.0);
        self.ensure(height);
        let bottom = self.y - height;
        self.fill_rect(MARGIN, bottom, CONTENT_WIDTH, height, NOTICE_TINT);
        self.stroke_rect(MARGIN, bottom, CONTENT_WIDTH, height, 2.0, RED);
        let mut baseline = self.y - PAD - 10.0;
        self.text(
          lead,
          Font::Bold,
          10.0,
          BODY,
          MARGIN + PAD,
          baseline,
          CONTENT_WIDTH,
          Align::Left,
        );
        baseline -= 32.0;
        for line in lines {
          self.text(
            &line,
            Font::Regular,
            10.0,
            BODY,
            MARGIN + PAD,
            baseline,
            CONTENT_WIDTH,
            Align::Left,
          );
          baseline -= 16.0;
        }
        self.y = bottom;
      }
      Block::FundusImage(path) => self.image(path),
      Block::Footer(text) => {
        self.boxed_line(text, Font::Regular, 8.0, FAINT, 3.0, None, None, Align::Center)
      }
      Block::Spacer(height) => self.skip(*height),
      Block::PageBreak => {
        if !self.ops.is_empty() {
          self.new_page();
        }
      }
    }
  }
}

fn image_stream(image: &RgbImage) -> Stream {
  Stream::new(
    dictionary! {
      "Type" => "XObject",
      "Subtype" => "Image",
      "Width" => image.width() as i64,
      "Height" => image.height() as i64,
      "ColorSpace" => "DeviceRGB",
      "BitsPerComponent" => 8,
    },
    image.as_raw().clone(),
  )
}

/// 用 lopdf 把报告排版成 A4 PDF
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfReportWriter;

impl PdfReportWriter {
  /// 生成未压缩的文档对象
  pub fn build_document(&self, report: &Report) -> Result<Document, ReportError> {
    let mut layout = Layout::new();
    for block in &report.blocks {
      layout.block(block);
    }
    let (pages, images) = layout.finish();

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut fonts = Dictionary::new();
    for (resource, base) in [
      ("F1", "Helvetica"),
      ("F2", "Helvetica-Bold"),
      ("F3", "Helvetica-Oblique"),
    ] {
      let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => base,
        "Encoding" => "WinAnsiEncoding",
      });
      fonts.set(resource, font_id);
    }

    let mut xobjects = Dictionary::new();
    for (i, image) in images.iter().enumerate() {
      let image_id = doc.add_object(image_stream(image));
      xobjects.set(format!("Im{}", i + 1), image_id);
    }

    let resources_id = doc.add_object(dictionary! {
      "Font" => fonts,
      "XObject" => xobjects,
    });

    let mut kids = Vec::with_capacity(pages.len());
    for operations in pages {
      let content = Content { operations };
      let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
      let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
      });
      kids.push(Object::from(page_id));
    }

    let count = kids.len() as i64;
    let pages = dictionary! {
      "Type" => "Pages",
      "Kids" => kids,
      "Count" => count,
      "Resources" => resources_id,
      "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
      "Type" => "Catalog",
      "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    Ok(doc)
  }

  pub fn write<W: Write>(&self, report: &Report, out: &mut W) -> Result<(), ReportError> {
    let mut doc = self.build_document(report)?;
    doc.compress();
    doc.save_to(out)?;
    Ok(())
  }

  pub fn to_bytes(&self, report: &Report) -> Result<Vec<u8>, ReportError> {
    let mut bytes = Vec::new();
    self.write(report, &mut bytes)?;
    Ok(bytes)
  }
}

/// `pdf:///path/to/report.pdf` 输出
pub struct PdfReportOutput {
  path: PathBuf,
  manifest: ModelManifest,
}

impl FromUrlWithScheme for PdfReportOutput {
  const SCHEME: &'static str = "pdf";
}

impl FromUrl for PdfReportOutput {
  type Error = ReportError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReportError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(PdfReportOutput {
      path: path_from_url(url),
      manifest: ModelManifest::builtin()?,
    })
  }
}

impl PdfReportOutput {
  /// 使用实际加载的模型清单生成置信度表和模型信息
  pub fn with_manifest(mut self, manifest: ModelManifest) -> Self {
    self.manifest = manifest;
    self
  }
}

impl Render<FundusFrame, ClassificationResult> for PdfReportOutput {
  type Error = ReportError;

  fn render_result(
    &self,
    frame: &FundusFrame,
    result: &ClassificationResult,
  ) -> Result<(), Self::Error> {
    let report = Report::build(&ReportContext {
      image_path: frame.source(),
      result,
      labels: self.manifest.labels(),
      model: self.manifest.model(),
      analysed_at: Local::now(),
      processing_time: None,
    });

    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let mut file = BufWriter::new(File::create(&self.path)?);
    PdfReportWriter.write(&report, &mut file)?;
    file.flush()?;

    info!("报告 {} 已写入: {}", report.id, self.path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{INPUT_SHAPE, RgbNhwcTensor};
  use std::time::Duration;

  fn report(image_path: &Path, probabilities: Vec<f32>) -> Report {
    let manifest = ModelManifest::builtin().unwrap();
    let result = manifest.labels().resolve(probabilities).unwrap();
    Report::build(&ReportContext {
      image_path,
      result: &result,
      labels: manifest.labels(),
      model: manifest.model(),
      analysed_at: Local::now(),
      processing_time: Some(Duration::from_millis(35)),
    })
  }

  fn page_text(doc: &Document) -> Vec<Vec<u8>> {
    doc
      .get_pages()
      .values()
      .map(|id| doc.get_page_content(*id).unwrap())
      .collect()
  }

  fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack
      .windows(needle.len())
      .any(|window| window == needle.as_bytes())
  }

  fn fundus_png(dir: &Path) -> PathBuf {
    let path = dir.join("eye.png");
    RgbImage::from_pixel(64, 48, image::Rgb([180, 60, 20]))
      .save(&path)
      .unwrap();
    path
  }

  #[test]
  fn positive_report_is_three_pages_with_recommendations() {
    let dir = tempfile::tempdir().unwrap();
    let image = fundus_png(dir.path());
    let doc = PdfReportWriter
      .build_document(&report(&image, vec![0.91, 0.09]))
      .unwrap();

    let pages = page_text(&doc);
    assert_eq!(pages.len(), 3);
    assert!(contains(&pages[0], "SCREENING RESULT"));
    assert!(contains(&pages[1], "LIFESTYLE RECOMMENDATIONS"));
    assert!(contains(&pages[1], "FOLLOW-UP SCREENING SCHEDULE"));
    assert!(contains(&pages[2], "IMPORTANT MEDICAL DISCLAIMER"));
  }

  #[test]
  fn negative_report_omits_recommendations() {
    let dir = tempfile::tempdir().unwrap();
    let image = fundus_png(dir.path());
    let doc = PdfReportWriter
      .build_document(&report(&image, vec![0.2, 0.8]))
      .unwrap();

    let pages = page_text(&doc);
    assert!(pages.iter().all(|p| !contains(p, "LIFESTYLE RECOMMENDATIONS")));
    assert!(pages.iter().all(|p| !contains(p, "DIETARY RECOMMENDATIONS")));
    assert!(contains(&pages[1], "FOLLOW-UP SCREENING SCHEDULE"));
  }

  #[test]
  fn fundus_image_is_embedded() {
    let dir = tempfile::tempdir().unwrap();
    let image = fundus_png(dir.path());
    let doc = PdfReportWriter
      .build_document(&report(&image, vec![0.2, 0.8]))
      .unwrap();

    let images: Vec<_> = doc
      .objects
      .values()
      .filter_map(|obj| obj.as_stream().ok())
      .filter(|stream| matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Image"))
      .collect();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].content.len(), 64 * 48 * 3);
  }

  #[test]
  fn missing_image_is_noted_not_fatal() {
    let doc = PdfReportWriter
      .build_document(&report(Path::new("/no/such/eye.png"), vec![0.2, 0.8]))
      .unwrap();
    let pages = page_text(&doc);
    assert!(pages.iter().any(|p| contains(p, IMAGE_LOAD_FAILED)));
  }

  #[test]
  fn written_bytes_are_a_loadable_pdf() {
    let bytes = PdfReportWriter
      .to_bytes(&report(Path::new("/no/such/eye.png"), vec![0.7, 0.3]))
      .unwrap();
    assert!(bytes.starts_with(b"%PDF-1.5"));

    let doc = Document::load_mem(&bytes).unwrap();
    assert_eq!(doc.get_pages().len(), 3);
  }

  #[test]
  fn long_text_wraps_within_content_width() {
    let text = "word ".repeat(200);
    let lines = wrap(&text, Font::Regular, 10.0, CONTENT_WIDTH);
    assert!(lines.len() > 1);
    assert!(
      lines
        .iter()
        .all(|l| text_width(l, Font::Regular, 10.0) <= CONTENT_WIDTH)
    );
  }

  #[test]
  fn long_tokens_are_hard_broken() {
    let token = "Proliferative_Diabetic_Retinopathy_With_Macular_Edema_".repeat(4);
    let width = 150.0;
    let lines = wrap(&format!("Grade {token} end"), Font::Bold, 10.0, width);
    assert!(lines.len() > 2);
    assert!(lines.iter().all(|l| text_width(l, Font::Bold, 10.0) <= width));
    assert_eq!(lines.concat().replace(' ', ""), format!("Grade{token}end"));
  }

  #[test]
  fn tall_table_row_stays_inside_margins() {
    let mut layout = Layout::new();
    let rows = vec![vec![
      "Label".to_string(),
      "finding ".repeat(900),
    ]];
    layout.table(None, &rows, &[100.0, 150.0], true, GRID);
    let (pages, _) = layout.finish();
    assert!(pages.len() >= 2);

    for ops in &pages {
      for op in ops.iter().filter(|op| op.operator == "re") {
        let y = op.operands[1].as_float().unwrap();
        let h = op.operands[3].as_float().unwrap();
        assert!(y >= MARGIN - 0.01, "rect below bottom margin: {y}");
        assert!(y + h <= PAGE_HEIGHT - MARGIN + 0.01, "rect above top margin: {}", y + h);
      }
      for op in ops.iter().filter(|op| op.operator == "Td") {
        let baseline = op.operands[1].as_float().unwrap();
        assert!(baseline >= MARGIN, "text below bottom margin: {baseline}");
      }
    }
  }

  #[test]
  fn overflowing_blocks_flow_to_next_page() {
    let report = Report {
      id: "DR-test".to_string(),
      blocks: (0..120)
        .map(|i| Block::Paragraph(format!("line {i}")))
        .collect(),
    };
    let doc = PdfReportWriter.build_document(&report).unwrap();
    assert!(doc.get_pages().len() >= 2);
  }

  #[test]
  fn win_ansi_maps_report_symbols() {
    assert_eq!(win_ansi("224\u{d7}224"), b"224\xd7224".to_vec());
    assert_eq!(win_ansi("\u{2022} 6\u{2013}12"), b"\x95 6\x9612".to_vec());
    assert_eq!(win_ansi("视"), b"?".to_vec());
  }

  #[test]
  fn render_writes_pdf_file() {
    let dir = tempfile::tempdir().unwrap();
    let image = fundus_png(dir.path());
    let target = dir.path().join("reports/out.pdf");
    let url = Url::from_file_path(&target).unwrap();
    let url = Url::parse(&format!("pdf://{}", url.path())).unwrap();
    let output = PdfReportOutput::from_url(&url).unwrap();

    let manifest = ModelManifest::builtin().unwrap();
    let result = manifest.labels().resolve(vec![0.4, 0.6]).unwrap();
    let frame = FundusFrame::new(&image, RgbNhwcTensor::zeros(INPUT_SHAPE));
    output.render_result(&frame, &result).unwrap();

    let bytes = std::fs::read(&target).unwrap();
    assert!(bytes.starts_with(b"%PDF"));
  }
}
