// 该文件是 Retinex （视网膜筛查） 项目的一部分。
// src/output/report.rs - 筛查报告内容
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

//! 报告内容与版式无关：[`Report::build`] 只产出一串 [`Block`]，
//! 由具体的写出器（PDF 等）决定如何排版。

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::model::{ClassificationResult, Finding, LabelMap, ModelInfo};

pub const REPORT_TITLE: &str = "Retinex Retinopathy Detection";
pub const REPORT_SUBTITLE: &str = "AI Based Retinopathy Detection";
pub const REPORT_FILE_NAME: &str = "Medical_Analysis_Report.pdf";
pub const IMAGE_LOAD_FAILED: &str = "Image load failed.";

/// 报告中的一个排版单元
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
  Title(String),
  Subtitle(String),
  /// 横线，参数为线宽
  Rule(f32),
  /// 带边框的报告标题
  Banner(String),
  Heading(String),
  Paragraph(String),
  /// 加粗的前缀加正文，用于列表
  Bullet { lead: String, text: String },
  /// 醒目的筛查结论
  Verdict { text: String, finding: Finding },
  /// 左列为键的两列表格
  KeyValue(Vec<(String, String)>),
  Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    widths: Vec<f32>,
  },
  /// 带边框的提示框，第一行加粗
  Notice { lead: String, text: String },
  FundusImage(PathBuf),
  Footer(String),
  Spacer(f32),
  PageBreak,
}

/// 生成报告所需的全部输入
pub struct ReportContext<'a> {
  pub image_path: &'a Path,
  pub result: &'a ClassificationResult,
  pub labels: &'a LabelMap,
  pub model: &'a ModelInfo,
  pub analysed_at: DateTime<Local>,
  pub processing_time: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
  pub id: String,
  pub blocks: Vec<Block>,
}

const LIFESTYLE: [(&str, &str); 6] = [
  ("Blood Glucose Control", "Maintain HbA1c below 7%."),
  ("Blood Pressure", "Target < 130/80 mmHg."),
  ("Exercise", "150 minutes of activity weekly."),
  ("Smoking", "Quit immediately."),
  ("Weight", "Maintain healthy BMI."),
  ("Stress", "Practice relaxation and sleep well."),
];

const DIET: [[&str; 3]; 6] = [
  ["Vegetables", "Spinach, broccoli", "Fried vegetables"],
  ["Fruits", "Berries, apples", "Fruit juices"],
  ["Proteins", "Fish, legumes", "Processed meats"],
  ["Grains", "Whole grains", "White bread"],
  ["Fats", "Olive oil, nuts", "Trans fats"],
  ["Beverages", "Water, green tea", "Sugary drinks"],
];

const FOLLOW_UP: [(&str, &str); 4] = [
  ("No DR detected:", "Annual eye exam"),
  ("Mild DR:", "Every 6\u{2013}12 months"),
  ("Moderate\u{2013}Severe:", "Every 3\u{2013}6 months"),
  ("Any vision change:", "Immediate consultation"),
];

fn s(text: &str) -> String {
  text.to_string()
}

/// 概率换算为百分比并保留两位小数，表格显示与解读使用同一个值
pub fn rounded_percent(probability: f32) -> f64 {
  (f64::from(probability) * 10_000.0).round() / 100.0
}

/// 置信度解读：超过 50% 时按该类别的结论给出阳性或阴性发现
pub fn interpretation(percent: f64, finding: Finding) -> &'static str {
  if percent > 50.0 {
    match finding {
      Finding::Positive => "Positive finding",
      Finding::Negative => "Negative finding",
    }
  } else {
    "Low probability"
  }
}

pub fn report_id(at: &DateTime<Local>) -> String {
  format!("DR-{}", at.format("%Y%m%d%H%M%S"))
}

fn format_processing_time(elapsed: Option<Duration>) -> String {
  match elapsed {
    Some(d) if d.as_secs_f64() < 1.0 => format!("{} ms", d.as_millis()),
    Some(d) => format!("{:.2} seconds", d.as_secs_f64()),
    None => s("Not recorded"),
  }
}

impl Report {
  pub fn build(ctx: &ReportContext<'_>) -> Report {
    let id = report_id(&ctx.analysed_at);
    let analysis_date = ctx.analysed_at.format("%B %d, %Y at %H:%M").to_string();
    let [height, width, _] = ctx.model.input_shape;
    let mut blocks = Vec::new();

    // 第一页
    blocks.push(Block::Title(s(REPORT_TITLE)));
    blocks.push(Block::Subtitle(s(REPORT_SUBTITLE)));
    blocks.push(Block::Spacer(10.0));
    blocks.push(Block::Rule(2.0));
    blocks.push(Block::Spacer(20.0));
    blocks.push(Block::Banner(s("DIABETIC RETINOPATHY SCREENING REPORT")));

    blocks.push(Block::KeyValue(vec![
      (s("Report ID :"), id.clone()),
      (s("Analysis Date :"), analysis_date.clone()),
      (
        s("Scan Type :"),
        s("Fundus Photography (Digital Retinal Imaging)"),
      ),
      (
        s("Image Resolution :"),
        format!("{}\u{d7}{} pixels (Processed)", width, height),
      ),
      (s("AI Model :"), ctx.model.display_name()),
      (
        s("Processing Time :"),
        format_processing_time(ctx.processing_time),
      ),
    ]));
    blocks.push(Block::Spacer(25.0));

    blocks.push(Block::Heading(s("CLINICAL ASSESSMENT")));
    blocks.push(Block::Paragraph(s(
      "This automated screening analysis evaluates digital fundus photography for clinical \
       indicators of diabetic retinopathy. The retinal image was resized, normalized and \
       classified by a convolutional neural network trained on graded fundus photographs.",
    )));
    blocks.push(Block::Spacer(20.0));

    blocks.push(Block::Heading(s("SCREENING RESULT")));
    blocks.push(Block::Verdict {
      text: ctx.result.label.clone(),
      finding: ctx.result.finding,
    });
    blocks.push(Block::Spacer(20.0));

    blocks.push(Block::Heading(s("PREDICTION CONFIDENCE LEVELS")));
    let rows = ctx
      .labels
      .iter()
      .map(|entry| {
        let p = ctx
          .result
          .probabilities
          .get(entry.index)
          .copied()
          .unwrap_or(0.0);
        let percent = rounded_percent(p);
        vec![
          entry.name.clone(),
          format!("{:.2}%", percent),
          s(interpretation(percent, entry.finding)),
        ]
      })
      .collect();
    blocks.push(Block::Table {
      header: vec![
        s("Classification"),
        s("Confidence (%)"),
        s("Interpretation"),
      ],
      rows,
      widths: vec![200.0, 140.0, 155.0],
    });
    blocks.push(Block::Spacer(25.0));

    // 第二页
    blocks.push(Block::PageBreak);

    if ctx.result.finding == Finding::Positive {
      blocks.push(Block::Heading(s("LIFESTYLE RECOMMENDATIONS")));
      blocks.push(Block::KeyValue(
        LIFESTYLE
          .iter()
          .map(|(lead, text)| (s(lead), s(text)))
          .collect(),
      ));
      blocks.push(Block::Spacer(15.0));

      blocks.push(Block::Heading(s("DIETARY RECOMMENDATIONS")));
      blocks.push(Block::Paragraph(s(
        "A retinal-protective diet rich in antioxidants and omega-3 helps prevent progression:",
      )));
      blocks.push(Block::Spacer(12.0));
      blocks.push(Block::Table {
        header: vec![
          s("Food Category"),
          s("Recommended Foods"),
          s("Foods to Limit"),
        ],
        rows: DIET
          .iter()
          .map(|row| row.iter().map(|cell| s(cell)).collect())
          .collect(),
        widths: vec![95.0, 200.0, 200.0],
      });
      blocks.push(Block::Spacer(20.0));
    }

    blocks.push(Block::Heading(s("FOLLOW-UP SCREENING SCHEDULE")));
    for (lead, text) in FOLLOW_UP {
      blocks.push(Block::Bullet {
        lead: s(lead),
        text: s(text),
      });
    }
    blocks.push(Block::Spacer(20.0));

    blocks.push(Block::Heading(s("ANALYZED FUNDUS IMAGE")));
    blocks.push(Block::Spacer(15.0));
    blocks.push(Block::FundusImage(ctx.image_path.to_path_buf()));
    blocks.push(Block::Spacer(15.0));

    blocks.push(Block::Rule(1.0));
    blocks.push(Block::Footer(format!(
      "{} | Report generated on {}",
      REPORT_TITLE, analysis_date
    )));

    // 第三页
    blocks.push(Block::PageBreak);
    blocks.push(Block::Heading(s("IMPORTANT MEDICAL DISCLAIMER")));
    blocks.push(Block::Notice {
      lead: s("THIS IS AN AI-ASSISTED SCREENING TOOL ONLY"),
      text: s("Not a substitute for medical diagnosis. Seek professional evaluation."),
    });
    blocks.push(Block::Spacer(20.0));

    Report { id, blocks }
  }

  pub fn headings(&self) -> impl Iterator<Item = &str> {
    self.blocks.iter().filter_map(|block| match block {
      Block::Heading(text) => Some(text.as_str()),
      _ => None,
    })
  }

  pub fn page_count(&self) -> usize {
    1 + self
      .blocks
      .iter()
      .filter(|block| matches!(block, Block::PageBreak))
      .count()
  }
}
